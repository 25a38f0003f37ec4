//! Executable memory for translated code.
//!
//! Translated blocks are small (tens to hundreds of bytes) and short-lived relative to the
//! process, so asking the OS for one mapping per block would waste both address space and
//! syscalls. [`ExecAllocator`] instead obtains coarse arenas (4 MiB by default) with
//! read/write/execute permission and sub-allocates fixed-granularity runs from each arena using a
//! per-arena bitmap. Requests larger than an arena bypass the arenas and get a dedicated mapping
//! sized exactly to the request.
//!
//! The crate also owns the host-facing seams the rest of the workspace builds on:
//! - [`MemoryProvider`]: where arena/oversized mappings come from ([`HostMemory`] uses `mmap`).
//! - [`PageProtect`]: how page permissions are changed ([`HostPageProtect`] uses `mprotect`).
//! - [`Protector`]: page rounding on top of a [`PageProtect`] backend, safe to call from a
//!   signal handler.

mod allocator;
mod arena;
mod bitmap;
mod error;
mod host;

pub use allocator::{ExecAllocator, ExecBlock, ExecMemConfig, ExecMemStats};
pub use error::{ExecMemError, Result};
pub use host::{
    align_down, align_up, page_size, HostMemory, HostPageProtect, MemoryProvider, PageFlags,
    PageProtect, Protector,
};
