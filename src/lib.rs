#![forbid(unsafe_code)]
//! Tempora: a temporal stream-query engine core.
//!
//! Re-exports the workspace crates under one roof:
//!
//! - `tempora_core`: time encodings, policies, configuration, stream keys, errors
//! - `tempora_mem`: pooled columns, batches, memory pools, checkpoint framing
//! - `tempora_operators`: the operator contract and the built-in operators
//! - `tempora_exec`: the scheduler and the `Engine` runtime

pub use tempora_core;
pub use tempora_exec;
pub use tempora_mem;
pub use tempora_operators;

pub use tempora_core::prelude::*;
pub use tempora_exec::{Engine, ExecError, Scheduler, TaskHandle};
pub use tempora_mem::{Batch, MemoryPool, PoolRegistry};
pub use tempora_operators::{BinaryObserver, Change, Observer, Pipe, StreamEvent};
