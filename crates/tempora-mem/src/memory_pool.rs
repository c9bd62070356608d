//! Batch pool for one `(K, P)` pair.
//!
//! A memory pool bundles the column pools a batch of `(K, P)` draws from.
//! Time, hash and bit-vector pools are shared with every other memory pool of
//! the same registry since their element types do not depend on `K`/`P`.
//!
//! The pool also tracks a generation counter (advanced on every flush) so a
//! batch can tell whether it was created before the latest flush, and a count
//! of batches currently out for leak checks.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tempora_core::types::{Payload, StreamKey};

use crate::batch::Batch;
use crate::column::Column;
use crate::pool::{ColumnKind, ColumnPool};
use crate::tracking::PoolStatsSnapshot;

/// Free buffers retained per column pool when no registry supplies a limit.
pub const DEFAULT_RETAIN: usize = 1024;

struct PoolInner<K: StreamKey, P: Payload> {
    batch_size: usize,
    time: ColumnPool<i64>,
    keys: ColumnPool<K>,
    payloads: ColumnPool<P>,
    hashes: ColumnPool<i32>,
    bitvectors: ColumnPool<u64>,
    generation: AtomicU64,
    batches_out: AtomicUsize,
    batches_total: AtomicUsize,
}

/// Cheap to clone; clones hand out batches from the same pools.
pub struct MemoryPool<K: StreamKey, P: Payload> {
    inner: Arc<PoolInner<K, P>>,
}

impl<K: StreamKey, P: Payload> Clone for MemoryPool<K, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Column-pool counters for one memory pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MemoryPoolStats {
    pub batches_out: usize,
    pub batches_total: usize,
    pub time: PoolStatsSnapshot,
    pub keys: PoolStatsSnapshot,
    pub payloads: PoolStatsSnapshot,
    pub hashes: PoolStatsSnapshot,
    pub bitvectors: PoolStatsSnapshot,
}

impl<K: StreamKey, P: Payload> MemoryPool<K, P> {
    pub(crate) fn from_pools(
        batch_size: usize,
        time: ColumnPool<i64>,
        keys: ColumnPool<K>,
        payloads: ColumnPool<P>,
        hashes: ColumnPool<i32>,
        bitvectors: ColumnPool<u64>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                batch_size,
                time,
                keys,
                payloads,
                hashes,
                bitvectors,
                generation: AtomicU64::new(0),
                batches_out: AtomicUsize::new(0),
                batches_total: AtomicUsize::new(0),
            }),
        }
    }

    /// A pool with private column pools; handy for tests and single-operator use.
    pub fn standalone(batch_size: usize) -> Self {
        Self::from_pools(
            batch_size,
            ColumnPool::new(batch_size, DEFAULT_RETAIN, ColumnKind::Data),
            ColumnPool::new(batch_size, DEFAULT_RETAIN, ColumnKind::Data),
            ColumnPool::new(batch_size, DEFAULT_RETAIN, ColumnKind::Data),
            ColumnPool::new(batch_size, DEFAULT_RETAIN, ColumnKind::Data),
            ColumnPool::new(
                ColumnKind::BitVector.capacity_for(batch_size),
                DEFAULT_RETAIN,
                ColumnKind::BitVector,
            ),
        )
    }

    /// An empty batch with exclusively owned columns and a cleared bit-vector.
    pub fn get(&self) -> Batch<K, P> {
        self.note_batch_out();
        self.inner.batches_total.fetch_add(1, Ordering::Relaxed);
        Batch::assemble(
            self.clone(),
            self.inner.time.rent(),
            self.inner.time.rent(),
            self.inner.keys.rent(),
            self.inner.payloads.rent(),
            self.inner.hashes.rent(),
            self.inner.bitvectors.rent_zeroed(),
            0,
            self.generation(),
        )
    }

    pub fn get_time(&self) -> Column<i64> {
        self.inner.time.rent()
    }

    pub fn get_key(&self) -> Column<K> {
        self.inner.keys.rent()
    }

    pub fn get_payload(&self) -> Column<P> {
        self.inner.payloads.rent()
    }

    pub fn get_hash(&self) -> Column<i32> {
        self.inner.hashes.rent()
    }

    /// A cleared bit-vector column.
    pub fn get_bv(&self) -> Column<u64> {
        self.inner.bitvectors.rent_zeroed()
    }

    pub fn batch_size(&self) -> usize {
        self.inner.batch_size
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Start a new generation; called whenever the pipeline flushes.
    pub fn advance_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Batches handed out (including shares and copies) and not yet freed.
    pub fn batches_outstanding(&self) -> usize {
        self.inner.batches_out.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> MemoryPoolStats {
        MemoryPoolStats {
            batches_out: self.batches_outstanding(),
            batches_total: self.inner.batches_total.load(Ordering::Relaxed),
            time: self.inner.time.stats(),
            keys: self.inner.keys.stats(),
            payloads: self.inner.payloads.stats(),
            hashes: self.inner.hashes.stats(),
            bitvectors: self.inner.bitvectors.stats(),
        }
    }

    pub fn time_pool(&self) -> &ColumnPool<i64> {
        &self.inner.time
    }

    pub fn key_pool(&self) -> &ColumnPool<K> {
        &self.inner.keys
    }

    pub fn payload_pool(&self) -> &ColumnPool<P> {
        &self.inner.payloads
    }

    pub fn hash_pool(&self) -> &ColumnPool<i32> {
        &self.inner.hashes
    }

    pub fn bitvector_pool(&self) -> &ColumnPool<u64> {
        &self.inner.bitvectors
    }

    pub fn same_pool(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn note_batch_out(&self) {
        self.inner.batches_out.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn note_batch_in(&self) {
        self.inner.batches_out.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<K: StreamKey, P: Payload> fmt::Debug for MemoryPool<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("key", &std::any::type_name::<K>())
            .field("payload", &std::any::type_name::<P>())
            .field("batch_size", &self.inner.batch_size)
            .field("generation", &self.generation())
            .field("batches_out", &self.batches_outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempora_core::time::INFINITY;

    #[test]
    fn freed_batch_columns_are_recycled() {
        let pool = MemoryPool::<u32, String>::standalone(4);
        let mut b = pool.get();
        b.add(1, INFINITY, 1, "a".into());
        b.free();

        assert_eq!(pool.batches_outstanding(), 0);
        assert_eq!(pool.time_pool().available(), 2);
        assert_eq!(pool.payload_pool().available(), 1);

        let _again = pool.get();
        let s = pool.stats();
        assert_eq!(s.time.allocated, 2, "time columns reused");
        assert_eq!(s.batches_total, 2);
    }

    #[test]
    fn replacement_bitvector_is_cleared() {
        let pool = MemoryPool::<u32, u32>::standalone(70);
        let mut bv = pool.get_bv();
        assert_eq!(bv.capacity(), 2);
        bv.as_mut_slice()[1] = u64::MAX;
        drop(bv);
        assert!(pool.get_bv().as_slice().iter().all(|w| *w == 0));
    }

    proptest! {
        #[test]
        fn added_rows_round_trip(rows in prop::collection::vec((0i64..1_000, any::<u16>(), any::<i32>()), 0..64)) {
            let pool = MemoryPool::<u16, i32>::standalone(64);
            let mut b = pool.get();
            let mut sorted = rows.clone();
            sorted.sort_by_key(|r| r.0);
            for (sync, key, payload) in &sorted {
                b.add(*sync, sync + 1, *key, *payload);
            }
            prop_assert_eq!(b.len(), sorted.len());
            for (i, (sync, key, payload)) in sorted.iter().enumerate() {
                prop_assert_eq!(b.sync(i), *sync);
                prop_assert_eq!(b.other(i), sync + 1);
                prop_assert_eq!(b.key(i), key);
                prop_assert_eq!(b.payload(i), payload);
                prop_assert_eq!(b.hash(i), tempora_core::hash::key_hash(key));
            }
            prop_assert!(b.seal().is_ok());
        }

        #[test]
        fn shallow_clones_release_columns_once(n in 1usize..16) {
            let pool = MemoryPool::<u32, u64>::standalone(8);
            let mut b = pool.get();
            b.add(1, INFINITY, 1, 1);
            let clones: Vec<_> = (0..n).map(|_| b.share()).collect();

            b.free();
            prop_assert_eq!(pool.time_pool().stats().returned, 0);

            let mut clones = clones;
            let last = clones.pop();
            drop(clones);
            prop_assert_eq!(pool.time_pool().stats().returned, 0, "one holder still alive");
            drop(last);

            let s = pool.stats();
            prop_assert_eq!(s.time.returned, 2);
            prop_assert_eq!(s.keys.returned, 1);
            prop_assert_eq!(s.payloads.returned, 1);
            prop_assert_eq!(s.bitvectors.returned, 1);
            prop_assert_eq!(s.batches_out, 0);
        }
    }
}
