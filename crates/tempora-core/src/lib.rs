#![forbid(unsafe_code)]
//! tempora-core: shared vocabulary for the Tempora temporal stream engine.
//!
//! Everything here is plain data: timestamp encodings, event kinds, disorder /
//! punctuation / flush policies, the engine configuration, stream key kinds,
//! key hashing, and the error type carried on every operator's error channel.
//!
//! Columns, batches and pools live in `tempora-mem`; operators in
//! `tempora-operators`; the scheduler in `tempora-exec`.

pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod policy;
pub mod prelude;
pub mod time;
pub mod types;

/// Engine version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
