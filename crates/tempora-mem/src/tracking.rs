//! Lightweight pool accounting: allocations, rents, returns, peak outstanding.
//!
//! Keep this cheap; it sits on every rent/return. Tests use the snapshot to
//! prove buffers come back exactly once.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct PoolStats {
    allocated: AtomicUsize,
    rented: AtomicUsize,
    returned: AtomicUsize,
    discarded: AtomicUsize,
    peak_outstanding: AtomicUsize,
}

/// Point-in-time copy of [`PoolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    /// Buffers created because the free list was empty.
    pub allocated: usize,
    pub rented: usize,
    /// Buffers handed back by their last holder.
    pub returned: usize,
    /// Returned buffers dropped because the free list was at its retain limit.
    pub discarded: usize,
    pub outstanding: usize,
    pub peak_outstanding: usize,
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_rent(&self, fresh: bool) {
        if fresh {
            self.allocated.fetch_add(1, Ordering::Relaxed);
        }
        let rented = self.rented.fetch_add(1, Ordering::AcqRel) + 1;
        let outstanding = rented.saturating_sub(self.returned.load(Ordering::Acquire));
        self.record_outstanding(outstanding);
    }

    pub(crate) fn record_return(&self, kept: bool) {
        self.returned.fetch_add(1, Ordering::AcqRel);
        if !kept {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_outstanding(&self, outstanding: usize) {
        let mut cur = self.peak_outstanding.load(Ordering::Relaxed);
        while outstanding > cur {
            match self.peak_outstanding.compare_exchange(
                cur,
                outstanding,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
        #[cfg(feature = "tracing")]
        tracing::trace!(
            outstanding,
            peak = self.peak_outstanding.load(Ordering::Relaxed),
            "column pool usage"
        );
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        let rented = self.rented.load(Ordering::Acquire);
        let returned = self.returned.load(Ordering::Acquire);
        PoolStatsSnapshot {
            allocated: self.allocated.load(Ordering::Relaxed),
            rented,
            returned,
            discarded: self.discarded.load(Ordering::Relaxed),
            outstanding: rented.saturating_sub(returned),
            peak_outstanding: self.peak_outstanding.load(Ordering::Relaxed),
        }
    }
}
