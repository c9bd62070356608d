//! Type-keyed column pools.
//!
//! Each pool recycles fixed-capacity buffers of one element type. Renting
//! pops a free buffer or allocates a new one; a buffer comes back when the
//! last [`Column`] sharing it is dropped. The free list sits behind one
//! mutex per pool, so rent/return is safe from any scheduler thread.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::column::{Column, Element};
use crate::tracking::{PoolStats, PoolStatsSnapshot};

/// Whether a pool serves data columns or packed bit-vectors.
///
/// Bit-vector pools hold `ceil(batch_size / 64)` words per buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    Data,
    BitVector,
}

impl ColumnKind {
    /// Buffer length for a batch of `batch_size` rows.
    pub fn capacity_for(self, batch_size: usize) -> usize {
        match self {
            ColumnKind::Data => batch_size,
            ColumnKind::BitVector => batch_size.div_ceil(64),
        }
    }
}

/// Shared free list; columns keep a weak handle back to it.
pub(crate) struct FreeList<T> {
    slots: Mutex<Vec<Vec<T>>>,
    retain: usize,
    /// Set for element types that own memory; run on every kept buffer.
    reset: Option<fn(&mut [T])>,
    stats: PoolStats,
}

fn reset_to_default<T: Element>(slice: &mut [T]) {
    slice.fill(T::default());
}

impl<T> FreeList<T> {
    fn pop(&self) -> Option<Vec<T>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    pub(crate) fn give_back(&self, mut buf: Vec<T>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let kept = slots.len() < self.retain;
        if kept {
            if let Some(reset) = self.reset {
                reset(&mut buf);
            }
            slots.push(buf);
        }
        drop(slots);
        self.stats.record_return(kept);
    }

    fn available(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Recycling allocator for columns of element type `T`.
///
/// Cheap to clone; clones share the same free list.
pub struct ColumnPool<T: Element> {
    inner: Arc<FreeList<T>>,
    capacity: usize,
    kind: ColumnKind,
}

impl<T: Element> Clone for ColumnPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            capacity: self.capacity,
            kind: self.kind,
        }
    }
}

impl<T: Element> ColumnPool<T> {
    /// A pool of `capacity`-element buffers keeping at most `retain` free ones.
    pub fn new(capacity: usize, retain: usize, kind: ColumnKind) -> Self {
        Self {
            inner: Arc::new(FreeList {
                slots: Mutex::new(Vec::new()),
                retain,
                reset: std::mem::needs_drop::<T>().then_some(reset_to_default::<T> as fn(&mut [T])),
                stats: PoolStats::new(),
            }),
            capacity,
            kind,
        }
    }

    /// Rent a column. Plain-data contents are whatever the previous holder
    /// left behind; elements that own memory (e.g. `String`) were reset to
    /// their default when the buffer came back.
    pub fn rent(&self) -> Column<T> {
        let (data, fresh) = match self.inner.pop() {
            Some(buf) => (buf, false),
            None => (vec![T::default(); self.capacity], true),
        };
        #[cfg(feature = "tracing")]
        if fresh {
            tracing::trace!(
                capacity = self.capacity,
                kind = ?self.kind,
                ty = std::any::type_name::<T>(),
                "column pool miss"
            );
        }
        self.inner.stats.record_rent(fresh);
        Column::from_pool(data, Arc::downgrade(&self.inner))
    }

    /// Rent a column with every element reset to `T::default()`.
    pub fn rent_zeroed(&self) -> Column<T> {
        let mut col = self.rent();
        col.as_mut_slice().fill(T::default());
        col
    }

    /// Release this holder's share of `column`. The buffer returns to its pool
    /// once no other holder remains.
    pub fn release(&self, column: Column<T>) {
        drop(column);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn kind(&self) -> ColumnKind {
        self.kind
    }

    /// Number of free buffers ready to be rented.
    pub fn available(&self) -> usize {
        self.inner.available()
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// True if `column` was rented from this pool.
    pub fn owns(&self, column: &Column<T>) -> bool {
        column.is_from(&self.inner)
    }
}
