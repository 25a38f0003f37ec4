use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExecMemError>;

#[derive(Debug, Error)]
pub enum ExecMemError {
    /// The OS refused to map (or extend) executable memory.
    #[error("out of memory mapping {len} bytes of executable memory: {source}")]
    OutOfMemory {
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("invalid executable memory configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("allocation size {len} overflows the host address space")]
    SizeOverflow { len: usize },
}
