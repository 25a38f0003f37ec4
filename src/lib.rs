//! Memory core of a dynamic binary translator.
//!
//! - [`exec_mem`]: executable arenas and host page primitives.
//! - [`block_map`]: guest address to translated block bookkeeping, with W^X protection toggling.
//! - [`context`]: per-process ownership and ordered teardown of the above.

pub use xlat_block_map as block_map;
pub use xlat_context as context;
pub use xlat_exec_mem as exec_mem;

pub use xlat_block_map::{BlockDescriptor, BlockMap, BlockMapConfig, RegionBlockList};
pub use xlat_context::{Context, ContextConfig, ContextHandle, FaultHandler, TeardownStage};
pub use xlat_exec_mem::{ExecAllocator, ExecBlock, ExecMemConfig, Protector};
