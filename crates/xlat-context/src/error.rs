use std::io;

use thiserror::Error;
use xlat_block_map::BlockMapError;
use xlat_exec_mem::ExecMemError;

pub type Result<T> = std::result::Result<T, ContextError>;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("invalid context configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("the code cache is disabled for this context")]
    CodeCacheDisabled,

    #[error("context has already been torn down")]
    Destroyed,

    #[error("a fault handler is already installed")]
    FaultHandlerBusy,

    #[error("failed to install the fault handler")]
    SignalInstall(#[source] io::Error),

    #[error(transparent)]
    ExecMem(#[from] ExecMemError),

    #[error(transparent)]
    BlockMap(#[from] BlockMapError),
}
