//! Convenient re-exports for downstream crates.

pub use crate::config::EngineConfig;
pub use crate::error::{Error, Result};
pub use crate::hash::key_hash;
pub use crate::id::OperatorId;
pub use crate::policy::{DisorderPolicy, FlushPolicy, PeriodicPunctuationPolicy};
pub use crate::time::{
    EventKind, Timestamp, INFINITY, LOW_WATERMARK_TIME, MIN_SYNC_TIME, PUNCTUATION_TIME,
};
pub use crate::types::{CompoundKey, Empty, KeyKind, PartitionKey, Payload, StreamKey};
