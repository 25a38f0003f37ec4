//! Lifecycle of one emulated process image.
//!
//! A [`Context`] owns the code cache (executable allocator plus block map), the loaded-module
//! table, the TLS image and the guest's argument, environment and library bookkeeping. It is
//! reached through counted [`ContextHandle`]s and torn down in [`TeardownStage`] order once the
//! last sharer and the last forked copy are gone.

mod config;
mod context;
mod error;
mod fault;
mod module;
mod teardown;
mod tls;

pub use config::ContextConfig;
pub use context::{CodeCache, Context, ContextHandle, ContextSlot, HandleKind};
pub use error::{ContextError, Result};
pub use fault::FaultHandler;
pub use module::{ModuleDescriptor, NeededLibrary, SearchPathKind};
pub use teardown::{Subsystem, TeardownReport, TeardownStage};
pub use tls::ThreadTls;
