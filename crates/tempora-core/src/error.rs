use thiserror::Error;

use crate::time::Timestamp;

/// Canonical result for core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors carried on an operator graph's error channel (`on_error`).
///
/// `Clone` so a fan-out operator can hand the same error to every consumer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("out-of-order event: sync time {sync} is below the watermark {watermark}")]
    OutOfOrder { sync: Timestamp, watermark: Timestamp },

    /// Appending past capacity or mutating a shared column. Never recovered.
    #[error("capacity violation: {0}")]
    CapacityViolation(String),

    #[error("unsupported control event: {0}")]
    UnsupportedControlEvent(String),

    #[error("scheduler fault in operator {operator}: {message}")]
    SchedulerFault { operator: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("internal invariant failed: {0}")]
    Invariant(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Checkpoint(e.to_string())
    }
}
