use thiserror::Error;

/// Result type local to tempora-mem.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("checkpoint I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad checkpoint header: {0}")]
    BadHeader(String),

    #[error("checkpoint checksum mismatch")]
    ChecksumMismatch,

    #[error("checkpoint codec error: {0}")]
    Codec(String),
}

impl From<Error> for tempora_core::error::Error {
    fn from(e: Error) -> Self {
        tempora_core::error::Error::Checkpoint(e.to_string())
    }
}
