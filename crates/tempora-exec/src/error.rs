use thiserror::Error;

use tempora_core::id::OperatorId;

pub type Result<T> = std::result::Result<T, ExecError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    /// The operator completed or was disposed; it takes no more work.
    #[error("operator {0} is retired")]
    Retired(OperatorId),

    #[error("scheduler is shut down")]
    ShutDown,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
