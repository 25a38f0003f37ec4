use thiserror::Error;
use xlat_exec_mem::ExecMemError;

pub type Result<T> = std::result::Result<T, BlockMapError>;

#[derive(Debug, Error)]
pub enum BlockMapError {
    #[error("invalid block map configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("guest range {addr:#x}+{len:#x} is outside the {limit_bits}-bit guest address space")]
    AddressOutOfRange { addr: u64, len: u64, limit_bits: u32 },

    #[error(transparent)]
    ExecMem(#[from] ExecMemError),
}
