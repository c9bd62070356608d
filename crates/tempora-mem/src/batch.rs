//! Columnar event batch.
//!
//! A batch is six equally sized columns plus a row count:
//!
//! | column      | element | meaning                                         |
//! |-------------|---------|-------------------------------------------------|
//! | `vsync`     | `i64`   | sync time (ordering time)                       |
//! | `vother`    | `i64`   | other time, see `tempora_core::time`            |
//! | `key`       | `K`     | grouping key                                    |
//! | `payload`   | `P`     | event payload                                   |
//! | `hash`      | `i32`   | precomputed key hash                            |
//! | `bitvector` | `u64`   | one bit per row; set for control rows and for deleted placeholders |
//!
//! Rows are appended with `add*` until the batch is full or sealed. Any column
//! may be shared with other batches; writers call [`Batch::make_writable`]
//! (or use the mutators here, which do so) before touching it.

use std::fmt;

use tempora_core::error::{Error, Result};
use tempora_core::hash::key_hash;
use tempora_core::time::{
    is_control_time, EventKind, Timestamp, LOW_WATERMARK_TIME, PUNCTUATION_TIME,
};
use tempora_core::types::{Payload, StreamKey};

use crate::capacity_violation;
use crate::column::Column;
use crate::memory_pool::MemoryPool;

/// Test bit `row` of a packed bit-vector (64 rows per word).
#[inline]
pub fn is_deleted(bv: &[u64], row: usize) -> bool {
    (bv[row >> 6] >> (row & 63)) & 1 == 1
}

#[inline]
fn set_bit(bv: &mut [u64], row: usize, on: bool) {
    let mask = 1u64 << (row & 63);
    if on {
        bv[row >> 6] |= mask;
    } else {
        bv[row >> 6] &= !mask;
    }
}

/// Names a single column for column-granular copy-on-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnId {
    Sync,
    Other,
    Key,
    Payload,
    Hash,
    BitVector,
}

impl ColumnId {
    pub const ALL: [ColumnId; 6] = [
        ColumnId::Sync,
        ColumnId::Other,
        ColumnId::Key,
        ColumnId::Payload,
        ColumnId::Hash,
        ColumnId::BitVector,
    ];
}

/// Borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a, K, P> {
    pub index: usize,
    pub sync: Timestamp,
    pub other: Timestamp,
    pub key: &'a K,
    pub payload: &'a P,
    pub hash: i32,
    /// `None` for a deleted placeholder.
    pub kind: Option<EventKind>,
}

pub struct Batch<K: StreamKey, P: Payload> {
    vsync: Column<i64>,
    vother: Column<i64>,
    key: Column<K>,
    payload: Column<P>,
    hash: Column<i32>,
    bitvector: Column<u64>,
    count: usize,
    iteration: u64,
    sealed: bool,
    pool: MemoryPool<K, P>,
}

impl<K: StreamKey, P: Payload> Batch<K, P> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        pool: MemoryPool<K, P>,
        vsync: Column<i64>,
        vother: Column<i64>,
        key: Column<K>,
        payload: Column<P>,
        hash: Column<i32>,
        bitvector: Column<u64>,
        count: usize,
        iteration: u64,
    ) -> Self {
        Self {
            vsync,
            vother,
            key,
            payload,
            hash,
            bitvector,
            count,
            iteration,
            sealed: false,
            pool,
        }
    }

    // ---- shape ----

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.vsync.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.capacity()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Pool generation this batch was allocated in.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// True once the owning pool has advanced past this batch's generation,
    /// i.e. the batch was created before the most recent flush.
    pub fn spans_flush(&self) -> bool {
        self.iteration < self.pool.generation()
    }

    pub fn pool(&self) -> &MemoryPool<K, P> {
        &self.pool
    }

    // ---- append ----

    /// Append a row, hashing `key` for the hash column.
    ///
    /// # Panics
    /// When the batch is full or sealed, or a column it writes is shared.
    #[track_caller]
    pub fn add(&mut self, sync: Timestamp, other: Timestamp, key: K, payload: P) {
        let hash = key_hash(&key);
        self.add_with_hash(sync, other, key, payload, hash);
    }

    /// Append a row with a hash computed upstream.
    #[track_caller]
    pub fn add_with_hash(&mut self, sync: Timestamp, other: Timestamp, key: K, payload: P, hash: i32) {
        if self.sealed {
            capacity_violation("append to a sealed batch");
        }
        if self.count >= self.capacity() {
            capacity_violation(format!(
                "append past batch capacity {}",
                self.capacity()
            ));
        }
        let row = self.count;
        self.vsync.as_mut_slice()[row] = sync;
        self.vother.as_mut_slice()[row] = other;
        self.key.as_mut_slice()[row] = key;
        self.payload.as_mut_slice()[row] = payload;
        self.hash.as_mut_slice()[row] = hash;
        set_bit(self.bitvector.as_mut_slice(), row, is_control_time(other));
        self.count += 1;
    }

    /// Recoverable append for callers that probe for room first.
    pub fn try_add(&mut self, sync: Timestamp, other: Timestamp, key: K, payload: P) -> Result<()> {
        if self.sealed {
            return Err(Error::CapacityViolation("append to a sealed batch".into()));
        }
        if self.is_full() {
            return Err(Error::CapacityViolation(format!(
                "batch is full ({} rows)",
                self.capacity()
            )));
        }
        self.add(sync, other, key, payload);
        Ok(())
    }

    /// Append a punctuation control row at `time`.
    #[track_caller]
    pub fn add_punctuation(&mut self, time: Timestamp) {
        self.add_with_hash(time, PUNCTUATION_TIME, K::default(), P::default(), 0);
    }

    /// Append a punctuation scoped to one partition of a partitioned stream.
    #[track_caller]
    pub fn add_keyed_punctuation(&mut self, time: Timestamp, key: K) {
        let hash = key_hash(&key);
        self.add_with_hash(time, PUNCTUATION_TIME, key, P::default(), hash);
    }

    /// Append a low-watermark control row at `time`.
    #[track_caller]
    pub fn add_low_watermark(&mut self, time: Timestamp) {
        self.add_with_hash(time, LOW_WATERMARK_TIME, K::default(), P::default(), 0);
    }

    // ---- row access ----

    pub fn sync(&self, row: usize) -> Timestamp {
        self.vsync.as_slice()[row]
    }

    pub fn other(&self, row: usize) -> Timestamp {
        self.vother.as_slice()[row]
    }

    pub fn key(&self, row: usize) -> &K {
        &self.key.as_slice()[row]
    }

    pub fn payload(&self, row: usize) -> &P {
        &self.payload.as_slice()[row]
    }

    pub fn hash(&self, row: usize) -> i32 {
        self.hash.as_slice()[row]
    }

    pub fn vsync(&self) -> &[i64] {
        &self.vsync.as_slice()[..self.count]
    }

    pub fn vother(&self) -> &[i64] {
        &self.vother.as_slice()[..self.count]
    }

    pub fn keys(&self) -> &[K] {
        &self.key.as_slice()[..self.count]
    }

    pub fn payloads(&self) -> &[P] {
        &self.payload.as_slice()[..self.count]
    }

    pub fn hashes(&self) -> &[i32] {
        &self.hash.as_slice()[..self.count]
    }

    /// The full bit-vector column (`ceil(capacity / 64)` words).
    pub fn bitvector(&self) -> &[u64] {
        self.bitvector.as_slice()
    }

    /// Raw bit for `row`: set for control rows and deleted placeholders.
    pub fn is_deleted(&self, row: usize) -> bool {
        is_deleted(self.bitvector.as_slice(), row)
    }

    /// A deleted data row: bit set, `other` not a control marker.
    pub fn is_tombstone(&self, row: usize) -> bool {
        self.is_deleted(row) && !is_control_time(self.other(row))
    }

    /// Shape of `row`, or `None` for a deleted placeholder.
    pub fn row_kind(&self, row: usize) -> Option<EventKind> {
        if self.is_tombstone(row) {
            None
        } else {
            Some(EventKind::classify(self.sync(row), self.other(row)))
        }
    }

    fn row_ref(&self, index: usize) -> RowRef<'_, K, P> {
        RowRef {
            index,
            sync: self.sync(index),
            other: self.other(index),
            key: self.key(index),
            payload: self.payload(index),
            hash: self.hash(index),
            kind: self.row_kind(index),
        }
    }

    /// Every row, placeholders included.
    pub fn rows(&self) -> impl Iterator<Item = RowRef<'_, K, P>> + '_ {
        (0..self.count).map(move |i| self.row_ref(i))
    }

    /// Data and control rows; deleted placeholders skipped.
    pub fn live_rows(&self) -> impl Iterator<Item = RowRef<'_, K, P>> + '_ {
        self.rows().filter(|r| r.kind.is_some())
    }

    /// Smallest sync time among live rows.
    pub fn min_sync(&self) -> Option<Timestamp> {
        self.live_rows().map(|r| r.sync).min()
    }

    /// Largest sync time among live rows.
    pub fn max_sync(&self) -> Option<Timestamp> {
        self.live_rows().map(|r| r.sync).max()
    }

    // ---- mutation ----

    /// Make one column exclusively owned, copying it from the pool if shared.
    /// Returns `true` if a copy was taken.
    pub fn make_writable(&mut self, column: ColumnId) -> bool {
        let pool = &self.pool;
        match column {
            ColumnId::Sync => self.vsync.make_writable(pool.time_pool()),
            ColumnId::Other => self.vother.make_writable(pool.time_pool()),
            ColumnId::Key => self.key.make_writable(pool.key_pool()),
            ColumnId::Payload => self.payload.make_writable(pool.payload_pool()),
            ColumnId::Hash => self.hash.make_writable(pool.hash_pool()),
            ColumnId::BitVector => self.bitvector.make_writable(pool.bitvector_pool()),
        }
    }

    pub fn make_all_writable(&mut self) {
        for column in ColumnId::ALL {
            self.make_writable(column);
        }
    }

    /// Mark `row` as a deleted placeholder.
    pub fn set_deleted(&mut self, row: usize) {
        self.check_row(row);
        self.make_writable(ColumnId::BitVector);
        set_bit(self.bitvector.as_mut_slice(), row, true);
    }

    /// Clear the deleted bit of a data row.
    pub fn clear_deleted(&mut self, row: usize) {
        self.check_row(row);
        if is_control_time(self.other(row)) {
            return;
        }
        self.make_writable(ColumnId::BitVector);
        set_bit(self.bitvector.as_mut_slice(), row, false);
    }

    /// Overwrite the other time of `row`. The bit-vector is left alone, so
    /// turning a control row into a data value leaves a placeholder.
    pub fn set_other(&mut self, row: usize, other: Timestamp) {
        self.check_row(row);
        self.make_writable(ColumnId::Other);
        self.vother.as_mut_slice()[row] = other;
    }

    /// Overwrite the payload of `row`.
    pub fn set_payload(&mut self, row: usize, payload: P) {
        self.check_row(row);
        self.make_writable(ColumnId::Payload);
        self.payload.as_mut_slice()[row] = payload;
    }

    #[track_caller]
    fn check_row(&self, row: usize) {
        if row >= self.count {
            capacity_violation(format!("row {row} out of range for batch of {}", self.count));
        }
    }

    /// Close the batch for appends after checking that sync times are
    /// non-decreasing across live rows. Partitioned streams are ordered per
    /// partition only, so the check is skipped for them.
    pub fn seal(&mut self) -> Result<()> {
        if !K::PARTITIONED {
            let mut last: Option<Timestamp> = None;
            for row in self.live_rows() {
                if let Some(prev) = last {
                    if row.sync < prev {
                        return Err(Error::OutOfOrder {
                            sync: row.sync,
                            watermark: prev,
                        });
                    }
                }
                last = Some(row.sync);
            }
        }
        self.sealed = true;
        Ok(())
    }

    // ---- sharing ----

    /// Shallow clone: every column is shared with `self`.
    pub fn share(&self) -> Self {
        self.pool.note_batch_out();
        Self {
            vsync: self.vsync.clone(),
            vother: self.vother.clone(),
            key: self.key.clone(),
            payload: self.payload.clone(),
            hash: self.hash.clone(),
            bitvector: self.bitvector.clone(),
            count: self.count,
            iteration: self.iteration,
            sealed: self.sealed,
            pool: self.pool.clone(),
        }
    }

    /// Deep clone: every column copied into freshly rented buffers.
    pub fn deep_copy(&self) -> Self {
        self.pool.note_batch_out();
        let pool = &self.pool;
        Self {
            vsync: self.vsync.deep_copy(pool.time_pool()),
            vother: self.vother.deep_copy(pool.time_pool()),
            key: self.key.deep_copy(pool.key_pool()),
            payload: self.payload.deep_copy(pool.payload_pool()),
            hash: self.hash.deep_copy(pool.hash_pool()),
            bitvector: self.bitvector.deep_copy(pool.bitvector_pool()),
            count: self.count,
            iteration: self.iteration,
            sealed: self.sealed,
            pool: self.pool.clone(),
        }
    }

    /// Replace this batch's contents with `other`'s, sharing its columns when
    /// `deep` is false and copying them otherwise. The previous columns are
    /// released.
    pub fn clone_from(&mut self, other: &Self, deep: bool) {
        let pool = &self.pool;
        if deep {
            self.vsync = other.vsync.deep_copy(pool.time_pool());
            self.vother = other.vother.deep_copy(pool.time_pool());
            self.key = other.key.deep_copy(pool.key_pool());
            self.payload = other.payload.deep_copy(pool.payload_pool());
            self.hash = other.hash.deep_copy(pool.hash_pool());
            self.bitvector = other.bitvector.deep_copy(pool.bitvector_pool());
        } else {
            self.vsync = other.vsync.clone();
            self.vother = other.vother.clone();
            self.key = other.key.clone();
            self.payload = other.payload.clone();
            self.hash = other.hash.clone();
            self.bitvector = other.bitvector.clone();
        }
        self.count = other.count;
        self.iteration = other.iteration;
        self.sealed = other.sealed;
    }

    /// Release every column share and return the header to the pool.
    pub fn free(self) {
        drop(self);
    }
}

impl<K: StreamKey, P: Payload> Drop for Batch<K, P> {
    fn drop(&mut self) {
        self.pool.note_batch_in();
    }
}

impl<K: StreamKey + fmt::Debug, P: Payload + fmt::Debug> fmt::Debug for Batch<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("count", &self.count)
            .field("capacity", &self.capacity())
            .field("iteration", &self.iteration)
            .field("sealed", &self.sealed)
            .field("vsync", &self.vsync())
            .field("vother", &self.vother())
            .field("keys", &self.keys())
            .field("payloads", &self.payloads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempora_core::time::INFINITY;

    fn pool() -> MemoryPool<u32, i64> {
        MemoryPool::standalone(8)
    }

    #[test]
    fn rows_round_trip_and_classify() {
        let pool = pool();
        let mut b = pool.get();
        b.add(1, INFINITY, 7, 10);
        b.add(2, 5, 7, 20);
        b.add(6, 2, 7, 20);
        b.add_punctuation(6);

        assert_eq!(b.len(), 4);
        assert_eq!(b.vsync(), &[1, 2, 6, 6]);
        assert_eq!(b.payloads(), &[10, 20, 20, 0]);
        assert_eq!(b.hash(0), key_hash(&7u32));
        let kinds: Vec<_> = b.rows().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                Some(EventKind::StartEdge),
                Some(EventKind::Interval),
                Some(EventKind::EndEdge),
                Some(EventKind::Punctuation),
            ]
        );
        assert!(b.is_deleted(3), "control rows carry the bit");
        assert!(!b.is_tombstone(3));
    }

    #[test]
    fn try_add_reports_full_batch() {
        let pool = MemoryPool::<u32, i64>::standalone(2);
        let mut b = pool.get();
        b.try_add(1, 2, 0, 0).unwrap();
        b.try_add(2, 3, 0, 0).unwrap();
        assert!(matches!(
            b.try_add(3, 4, 0, 0),
            Err(Error::CapacityViolation(_))
        ));
    }

    #[test]
    #[should_panic(expected = "capacity violation")]
    fn add_past_capacity_is_fatal() {
        let pool = MemoryPool::<u32, i64>::standalone(1);
        let mut b = pool.get();
        b.add(1, 2, 0, 0);
        b.add(2, 3, 0, 0);
    }

    #[test]
    #[should_panic(expected = "capacity violation")]
    fn add_to_shared_batch_is_fatal() {
        let pool = pool();
        let mut b = pool.get();
        b.add(1, 2, 0, 0);
        let _view = b.share();
        b.add(2, 3, 0, 0);
    }

    #[test]
    fn set_deleted_copies_only_the_bitvector() {
        let pool = pool();
        let mut b = pool.get();
        b.add(1, 2, 1, 1);
        b.add(2, 3, 2, 2);
        let mut view = b.share();
        view.set_deleted(0);

        assert!(view.is_tombstone(0));
        assert!(!b.is_tombstone(0), "original keeps its bit-vector");
        assert_eq!(view.live_rows().count(), 1);
        assert_eq!(view.vsync().as_ptr(), b.vsync().as_ptr(), "sync column still shared");
    }

    #[test]
    fn seal_rejects_decreasing_sync() {
        let pool = pool();
        let mut b = pool.get();
        b.add(5, INFINITY, 0, 0);
        b.add(3, INFINITY, 0, 0);
        assert_eq!(
            b.seal(),
            Err(Error::OutOfOrder {
                sync: 3,
                watermark: 5
            })
        );

        let mut ok = pool.get();
        ok.add(3, INFINITY, 0, 0);
        ok.add(5, INFINITY, 0, 0);
        ok.seal().unwrap();
        assert!(ok.try_add(6, INFINITY, 0, 0).is_err());
    }

    #[test]
    fn seal_ignores_tombstones() {
        let pool = pool();
        let mut b = pool.get();
        b.add(5, INFINITY, 0, 0);
        b.add(1, INFINITY, 0, 0);
        b.add(6, INFINITY, 0, 0);
        b.set_deleted(1);
        b.seal().unwrap();
        assert_eq!(b.min_sync(), Some(5));
    }

    #[test]
    fn clone_from_shallow_then_deep() {
        let pool = pool();
        let mut src = pool.get();
        src.add(1, 2, 3, 4);

        let mut dst = pool.get();
        dst.clone_from(&src, false);
        assert_eq!(dst.vsync().as_ptr(), src.vsync().as_ptr());

        dst.clone_from(&src, true);
        assert_ne!(dst.vsync().as_ptr(), src.vsync().as_ptr());
        assert_eq!(dst.vsync(), src.vsync());
        assert_eq!(dst.payloads(), src.payloads());
    }

    #[test]
    fn spans_flush_tracks_pool_generation() {
        let pool = pool();
        let b = pool.get();
        assert!(!b.spans_flush());
        pool.advance_generation();
        assert!(b.spans_flush());
        assert!(!pool.get().spans_flush());
    }

    #[test]
    fn bit_indexing_matches_word_layout() {
        let bv = [0u64, 1u64 << 3];
        assert!(is_deleted(&bv, 67));
        assert!(!is_deleted(&bv, 3));
    }
}
