//! Scheduler counters.
//!
//! Plain atomics bumped on the scheduling path; export them from the binary
//! layer via `snapshot()`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    units_enqueued: AtomicU64,
    units_run: AtomicU64,
    units_dropped: AtomicU64,
    waves: AtomicU64,
    faults: AtomicU64,
    retired: AtomicU64,
}

/// Point-in-time copy of [`SchedulerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub units_enqueued: u64,
    pub units_run: u64,
    /// Data units freed without running, by `dispose`.
    pub units_dropped: u64,
    pub waves: u64,
    pub faults: u64,
    pub retired: u64,
}

impl SchedulerMetrics {
    pub(crate) fn enqueued(&self) {
        self.units_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn ran(&self, n: u64) {
        self.units_run.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self, n: u64) {
        self.units_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn wave(&self) {
        self.waves.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retire(&self) {
        self.retired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            units_enqueued: self.units_enqueued.load(Ordering::Relaxed),
            units_run: self.units_run.load(Ordering::Relaxed),
            units_dropped: self.units_dropped.load(Ordering::Relaxed),
            waves: self.waves.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
        }
    }
}
