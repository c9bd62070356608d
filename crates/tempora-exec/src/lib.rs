#![forbid(unsafe_code)]
//! tempora-exec: scheduler, task handles and the engine runtime.
//!
//! Operators are registered with a `Scheduler` and fed through the observer
//! adapters on their `TaskHandle`. The inline scheduler runs every callback
//! on the caller's thread; the threaded one drains per-operator queues on a
//! fixed worker pool in event-time order, one thread per operator at a time.

pub mod error;
pub mod metrics;
pub mod runtime;
pub mod scheduler;
pub mod task;

pub use error::{ExecError, Result};
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
pub use runtime::Engine;
pub use scheduler::{Scheduler, SchedulerKind};
pub use task::{ScheduledInput, ScheduledObserver, TaskHandle};
