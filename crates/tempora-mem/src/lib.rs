#![forbid(unsafe_code)]
//! tempora-mem: pooled columns, columnar batches, and batch pools.
//!
//! Ownership model:
//! - A [`Column`] is a reference-counted, fixed-capacity buffer. Cloning a
//!   column shares it; dropping the last holder hands the buffer back to the
//!   [`ColumnPool`] it was rented from instead of freeing it.
//! - A [`Batch`] owns (or shares) six columns. Shared columns are read-only;
//!   writers call `make_writable` first to get a private copy.
//! - A [`MemoryPool`] hands out batches for one `(K, P)` pair. Pools are
//!   looked up through an explicit [`PoolRegistry`], never global state.
//!
//! Checkpoint framing for operator state lives in [`checkpoint`].

pub mod batch;
pub mod checkpoint;
pub mod column;
pub mod error;
pub mod memory_pool;
pub mod pool;
pub mod registry;
pub mod tracking;

pub use batch::{Batch, ColumnId, RowRef};
pub use checkpoint::{read_state, write_state, BatchSnapshot};
pub use column::{Column, Element};
pub use memory_pool::{MemoryPool, MemoryPoolStats};
pub use pool::{ColumnKind, ColumnPool};
pub use registry::PoolRegistry;
pub use tracking::{PoolStats, PoolStatsSnapshot};

/// Abort on a capacity / sharing violation. These are programming errors and
/// are never turned into recoverable values.
#[track_caller]
pub(crate) fn capacity_violation(msg: impl Into<String>) -> ! {
    panic!("{}", tempora_core::error::Error::CapacityViolation(msg.into()))
}
