//! Disjoint union of two streams with the same `(K, P)`.
//!
//! The mode is picked from the key kind when the operator is built:
//!
//! - `Merge` (unpartitioned keys): rows are buffered per side and released in
//!   sync order once the other side can no longer produce anything earlier.
//!   Punctuations are merged as `min(left, right)`. Each side has its own
//!   disorder guard: a row below that side's last punctuation or last row is
//!   late and handled by the guard's policy.
//! - `PassThrough` (partitioned keys): batches are forwarded untouched except
//!   for inbound low watermarks, which are turned into deleted placeholders;
//!   the merged low watermark is emitted instead.

use std::collections::VecDeque;
use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use tempora_core::error::{Error, Result};
use tempora_core::policy::DisorderPolicy;
use tempora_core::time::{EventKind, Timestamp, INFINITY, MIN_SYNC_TIME};
use tempora_core::types::{KeyKind, Payload, StreamKey};
use tempora_mem::checkpoint::{read_state, write_state, BatchSnapshot};
use tempora_mem::{Batch, MemoryPool};

use crate::binary::Side;
use crate::plan::PlanNode;
use crate::punctuation::{Admission, DisorderGuard, PunctuationMerger};
use crate::traits::{BinaryObserver, Observer, Pipe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnionMode {
    Merge,
    PassThrough,
}

impl UnionMode {
    pub fn for_key<K: StreamKey>() -> Self {
        match K::KIND {
            KeyKind::Partitioned => UnionMode::PassThrough,
            KeyKind::Compound if K::PARTITIONED => UnionMode::PassThrough,
            KeyKind::Simple | KeyKind::Compound => UnionMode::Merge,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BufferedRow<K, P> {
    sync: Timestamp,
    other: Timestamp,
    key: K,
    payload: P,
    hash: i32,
}

#[derive(Serialize, Deserialize)]
struct UnionCheckpoint<K, P> {
    left: Vec<BufferedRow<K, P>>,
    right: Vec<BufferedRow<K, P>>,
    merger: PunctuationMerger,
    guards: [DisorderGuard; 2],
    last_out: Timestamp,
    output: Option<BatchSnapshot<K, P>>,
}

pub struct DisjointUnion<K: StreamKey, P: Payload> {
    mode: UnionMode,
    pool: MemoryPool<K, P>,
    downstream: Box<dyn Observer<K, P>>,
    left: VecDeque<BufferedRow<K, P>>,
    right: VecDeque<BufferedRow<K, P>>,
    merger: PunctuationMerger,
    /// Per-side watermarks, left then right.
    guards: [DisorderGuard; 2],
    /// Sync time of the last row released downstream.
    last_out: Timestamp,
    output: Option<Batch<K, P>>,
    terminated: bool,
    completed: bool,
}

impl<K: StreamKey, P: Payload> DisjointUnion<K, P> {
    pub fn new(pool: MemoryPool<K, P>, downstream: Box<dyn Observer<K, P>>) -> Self {
        Self {
            mode: UnionMode::for_key::<K>(),
            pool,
            downstream,
            left: VecDeque::new(),
            right: VecDeque::new(),
            merger: PunctuationMerger::new(),
            guards: [
                DisorderGuard::new(DisorderPolicy::default()),
                DisorderGuard::new(DisorderPolicy::default()),
            ],
            last_out: MIN_SYNC_TIME,
            output: None,
            terminated: false,
            completed: false,
        }
    }

    /// Policy for rows that arrive behind their side's watermark. Only
    /// applies in `Merge` mode.
    pub fn with_disorder_policy(mut self, policy: DisorderPolicy) -> Self {
        self.guards = [DisorderGuard::new(policy), DisorderGuard::new(policy)];
        self
    }

    pub fn mode(&self) -> UnionMode {
        self.mode
    }

    /// Rows held back waiting for the other side.
    pub fn buffered(&self) -> usize {
        self.left.len() + self.right.len()
    }

    fn guard(&mut self, side: Side) -> &mut DisorderGuard {
        match side {
            Side::Left => &mut self.guards[0],
            Side::Right => &mut self.guards[1],
        }
    }

    fn buffer(&mut self, side: Side) -> &mut VecDeque<BufferedRow<K, P>> {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    fn on_next_side(&mut self, side: Side, batch: Batch<K, P>) {
        if self.terminated {
            return;
        }
        match self.mode {
            UnionMode::Merge => self.merge_batch(side, batch),
            UnionMode::PassThrough => self.pass_batch(side, batch),
        }
    }

    fn merge_batch(&mut self, side: Side, batch: Batch<K, P>) {
        for row in batch.live_rows() {
            match row.kind {
                Some(EventKind::Punctuation) => self.advance(side, row.sync),
                Some(EventKind::LowWatermark) => {
                    self.fail(Error::UnsupportedControlEvent(
                        "low watermark reached a union over unpartitioned streams".into(),
                    ));
                    return;
                }
                Some(_) => {
                    let sync = match self.guard(side).admit(row.sync, row.other) {
                        Ok(Admission::Accept) => row.sync,
                        Ok(Admission::Adjust(t)) => t,
                        Ok(Admission::Drop) => continue,
                        Err(e) => {
                            self.fail(e);
                            return;
                        }
                    };
                    self.guard(side).advance(sync);
                    let buffered = BufferedRow {
                        sync,
                        other: row.other,
                        key: row.key.clone(),
                        payload: row.payload.clone(),
                        hash: row.hash,
                    };
                    self.buffer(side).push_back(buffered);
                }
                None => {}
            }
        }
        self.drain_ready();
    }

    fn pass_batch(&mut self, side: Side, mut batch: Batch<K, P>) {
        let mut advanced = None;
        for row in 0..batch.len() {
            if batch.row_kind(row) == Some(EventKind::LowWatermark) {
                let t = batch.sync(row);
                // bit stays set, so a data `other` leaves a placeholder
                batch.set_other(row, INFINITY);
                if let Some(m) = self.merger.update(side, t) {
                    advanced = Some(m);
                }
            }
        }
        if batch.live_rows().next().is_some() {
            self.push_output();
            self.downstream.on_next(batch);
        }
        if let Some(m) = advanced {
            self.emit(|b| b.add_low_watermark(m));
            self.push_output();
        }
    }

    /// Record a punctuation from `side`; emit the merged one if it advanced.
    fn advance(&mut self, side: Side, time: Timestamp) {
        self.guard(side).advance(time);
        self.drain_ready();
        if let Some(merged) = self.merger.update(side, time) {
            self.drain_ready();
            let t = merged.max(self.last_out);
            self.emit(|b| b.add_punctuation(t));
            self.push_output();
        }
    }

    /// Release buffered rows that no future input can precede.
    fn drain_ready(&mut self) {
        loop {
            let l = self.left.front().map(|r| r.sync);
            let r = self.right.front().map(|r| r.sync);
            let side = match (l, r) {
                (Some(a), Some(b)) => {
                    if a <= b {
                        Side::Left
                    } else {
                        Side::Right
                    }
                }
                (Some(a), None) if a <= self.merger.side(Side::Right) => Side::Left,
                (None, Some(b)) if b <= self.merger.side(Side::Left) => Side::Right,
                _ => break,
            };
            let Some(row) = self.buffer(side).pop_front() else {
                break;
            };
            self.last_out = self.last_out.max(row.sync);
            self.emit(|b| b.add_with_hash(row.sync, row.other, row.key, row.payload, row.hash));
        }
    }

    fn emit(&mut self, f: impl FnOnce(&mut Batch<K, P>)) {
        if self.output.as_ref().is_some_and(Batch::is_full) {
            self.push_output();
        }
        let pool = &self.pool;
        let batch = self.output.get_or_insert_with(|| pool.get());
        f(batch);
    }

    fn push_output(&mut self) {
        let Some(mut batch) = self.output.take() else {
            return;
        };
        if batch.is_empty() {
            return;
        }
        if let Err(e) = batch.seal() {
            self.fail(e);
            return;
        }
        self.downstream.on_next(batch);
    }

    fn complete_side(&mut self, side: Side) {
        if self.terminated || self.completed {
            return;
        }
        match self.mode {
            UnionMode::Merge => self.advance(side, INFINITY),
            UnionMode::PassThrough => {
                if let Some(m) = self.merger.complete(side) {
                    self.emit(|b| b.add_low_watermark(m));
                }
            }
        }
        if self.merger.is_complete() {
            self.push_output();
            self.completed = true;
            self.downstream.on_completed();
        }
    }

    fn fail(&mut self, error: Error) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.output = None;
        self.downstream.on_error(error);
    }
}

impl<K: StreamKey, P: Payload> BinaryObserver<K, P> for DisjointUnion<K, P> {
    fn on_next_left(&mut self, batch: Batch<K, P>) {
        self.on_next_side(Side::Left, batch);
    }

    fn on_next_right(&mut self, batch: Batch<K, P>) {
        self.on_next_side(Side::Right, batch);
    }

    fn on_completed_left(&mut self) {
        self.complete_side(Side::Left);
    }

    fn on_completed_right(&mut self) {
        self.complete_side(Side::Right);
    }

    fn on_flush(&mut self) {
        if self.terminated {
            return;
        }
        self.push_output();
        self.downstream.on_flush();
    }

    fn on_error(&mut self, error: Error) {
        self.fail(error);
    }
}

impl<K, P> Pipe for DisjointUnion<K, P>
where
    K: StreamKey + Serialize + DeserializeOwned,
    P: Payload + Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        "union"
    }

    fn checkpoint(&self, sink: &mut dyn Write) -> Result<()> {
        let state = UnionCheckpoint {
            left: self.left.iter().cloned().collect(),
            right: self.right.iter().cloned().collect(),
            merger: self.merger.clone(),
            guards: self.guards.clone(),
            last_out: self.last_out,
            output: self.output.as_ref().map(Batch::snapshot),
        };
        write_state(sink, &state)?;
        Ok(())
    }

    fn restore(&mut self, source: &mut dyn Read) -> Result<()> {
        let state: UnionCheckpoint<K, P> = read_state(source)?;
        self.left = state.left.into();
        self.right = state.right.into();
        self.merger = state.merger;
        self.guards = state.guards;
        self.last_out = state.last_out;
        self.output = state
            .output
            .map(|snap| self.pool.restore(snap))
            .transpose()?;
        self.terminated = false;
        self.completed = self.merger.is_complete();
        Ok(())
    }

    fn produce_query_plan(&self, previous: Vec<PlanNode>) -> PlanNode {
        PlanNode::new(self.name())
            .with_inputs(previous)
            .with_detail("mode", format!("{:?}", self.mode))
            .with_detail("disorder", self.guards[0].policy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{collector, data_rows, punctuations, Log, Seen};
    use tempora_core::types::PartitionKey;

    fn punct_batch(pool: &MemoryPool<u32, i64>, t: Timestamp) -> Batch<u32, i64> {
        let mut b = pool.get();
        b.add_punctuation(t);
        b
    }

    fn rows_batch(pool: &MemoryPool<u32, i64>, rows: &[Timestamp], punct: Timestamp) -> Batch<u32, i64> {
        let mut b = pool.get();
        for &t in rows {
            b.add(t, INFINITY, 0, t);
        }
        b.add_punctuation(punct);
        b
    }

    #[test]
    fn merged_punctuation_is_min_of_both_sides() {
        let pool = MemoryPool::standalone(8);
        let (out, log) = collector();
        let mut u = DisjointUnion::new(pool.clone(), out);
        assert_eq!(u.mode(), UnionMode::Merge);

        u.on_next_left(punct_batch(&pool, 5));
        u.on_next_right(punct_batch(&pool, 7));
        u.on_next_left(punct_batch(&pool, 10));
        u.on_next_right(punct_batch(&pool, 12));

        assert_eq!(punctuations(&log), vec![5, 7, 10]);
    }

    #[test]
    fn rows_are_released_in_sync_order() {
        let pool = MemoryPool::standalone(8);
        let (out, log) = collector();
        let mut u = DisjointUnion::new(pool.clone(), out);

        u.on_next_left(rows_batch(&pool, &[1, 4, 6], 6));
        assert_eq!(u.buffered(), 3, "right side has not spoken yet");
        u.on_next_right(rows_batch(&pool, &[2, 3, 7], 7));
        u.on_completed_left();
        u.on_completed_right();

        let syncs: Vec<_> = data_rows(&log).into_iter().map(|r| r.0).collect();
        assert_eq!(syncs, vec![1, 2, 3, 4, 6, 7]);
        assert_eq!(punctuations(&log), vec![6, 7, INFINITY]);
        assert_eq!(log.lock().unwrap().last(), Some(&Seen::Completed));
        assert_eq!(pool.batches_outstanding(), 0);
    }

    fn late_left_row(policy: DisorderPolicy) -> (Log<u32, i64>, MemoryPool<u32, i64>) {
        let pool = MemoryPool::standalone(8);
        let (out, log) = collector();
        let mut u = DisjointUnion::new(pool.clone(), out).with_disorder_policy(policy);
        u.on_next_left(punct_batch(&pool, 10));
        u.on_next_right(rows_batch(&pool, &[11], 12));
        u.on_next_left(rows_batch(&pool, &[3], 12));
        u.on_completed_left();
        u.on_completed_right();
        (log, pool)
    }

    #[test]
    fn late_row_on_one_side_is_an_error_by_default() {
        let (log, _pool) = late_left_row(DisorderPolicy::Throw);
        let log_vec = log.lock().unwrap().clone();
        assert!(log_vec.iter().any(|s| matches!(
            s,
            Seen::Error(Error::OutOfOrder { sync: 3, watermark: 10 })
        )));
        assert!(data_rows(&log).iter().all(|r| r.0 != 3), "late row was released");
    }

    #[test]
    fn late_row_is_discarded_under_drop() {
        let (log, pool) = late_left_row(DisorderPolicy::Drop);
        let syncs: Vec<_> = data_rows(&log).into_iter().map(|r| r.0).collect();
        assert_eq!(syncs, vec![11]);
        assert_eq!(punctuations(&log), vec![10, 12, INFINITY]);
        assert_eq!(pool.batches_outstanding(), 0);
    }

    #[test]
    fn late_row_is_clamped_to_its_side_watermark_under_adjust() {
        let (log, _pool) = late_left_row(DisorderPolicy::Adjust);
        let syncs: Vec<_> = data_rows(&log).into_iter().map(|r| r.0).collect();
        assert_eq!(syncs, vec![10, 11]);
        let log_vec = log.lock().unwrap().clone();
        let first_row = log_vec.iter().position(|s| matches!(s, Seen::Row { .. }));
        let first_punct = log_vec.iter().position(|s| matches!(s, Seen::Punctuation(10)));
        assert!(first_punct < first_row, "rows never precede an earlier punctuation");
        assert!(!log_vec.iter().any(|s| matches!(s, Seen::Error(_))));
    }

    #[test]
    fn low_watermark_in_merge_mode_is_unsupported() {
        let pool = MemoryPool::<u32, i64>::standalone(4);
        let (out, log) = collector();
        let mut u = DisjointUnion::new(pool.clone(), out);
        let mut b = pool.get();
        b.add_low_watermark(3);
        u.on_next_left(b);
        assert!(matches!(
            log.lock().unwrap().last(),
            Some(Seen::Error(Error::UnsupportedControlEvent(_)))
        ));
    }

    #[test]
    fn partitioned_inputs_pass_through_with_merged_low_watermark() {
        let pool = MemoryPool::<PartitionKey<u8>, i64>::standalone(8);
        let (out, log) = collector();
        let mut u = DisjointUnion::new(pool.clone(), out);
        assert_eq!(u.mode(), UnionMode::PassThrough);

        let mut l = pool.get();
        l.add(9, INFINITY, PartitionKey(1), 1);
        l.add_low_watermark(5);
        u.on_next_left(l);

        let mut r = pool.get();
        r.add(2, INFINITY, PartitionKey(2), 2);
        r.add_low_watermark(3);
        u.on_next_right(r);

        let mut r = pool.get();
        r.add_low_watermark(7);
        u.on_next_right(r);

        u.on_completed_left();
        u.on_completed_right();

        let log = log.lock().unwrap().clone();
        let lwms: Vec<_> = log
            .iter()
            .filter_map(|s| match s {
                Seen::LowWatermark(t) => Some(*t),
                _ => None,
            })
            .collect();
        assert_eq!(lwms, vec![3, 5, INFINITY]);
        let rows = log.iter().filter(|s| matches!(s, Seen::Row { .. })).count();
        assert_eq!(rows, 2, "inbound low watermarks became placeholders");
    }
}
