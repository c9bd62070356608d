//! Hopping-window aggregate.
//!
//! A window of `size` ticks closes every `hop` ticks. The window closing at
//! boundary `b` covers item sync times in `[b - size, b)` and produces one
//! interval row `[b, b + hop)` per group with at least one item in it.
//!
//! Per-group state is a sorted run of `(sync, payload)` items plus the
//! running aggregate over the prefix that has already been included. Groups
//! are found through the batch's hash column. Boundaries only close when a
//! punctuation (low watermark for partitioned streams) proves no earlier row
//! can still arrive.

mod aggregate;

use std::collections::VecDeque;
use std::io::{Read, Write};

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use tempora_core::error::{Error, Result};
use tempora_core::policy::DisorderPolicy;
use tempora_core::time::{quantize, EventKind, Timestamp, INFINITY};
use tempora_core::types::{Payload, StreamKey};
use tempora_mem::checkpoint::{read_state, write_state, BatchSnapshot};
use tempora_mem::{Batch, MemoryPool};

use crate::plan::PlanNode;
use crate::punctuation::{Admission, DisorderGuard};
use crate::traits::{Observer, Pipe};

pub use aggregate::{Aggregate, Average, Count, Sum};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Group<K, P, S> {
    key: K,
    hash: i32,
    /// Sorted by sync time.
    items: VecDeque<(Timestamp, P)>,
    /// `items[..included]` are folded into `state`.
    included: usize,
    state: S,
}

#[derive(Serialize, Deserialize)]
struct WindowCheckpoint<K, P, S, O> {
    groups: Vec<Group<K, P, S>>,
    guard: DisorderGuard,
    next_boundary: Option<Timestamp>,
    output: Option<BatchSnapshot<K, O>>,
    completed: bool,
}

pub struct HoppingWindow<K: StreamKey, P: Payload, A: Aggregate<P>> {
    size: Timestamp,
    hop: Timestamp,
    aggregate: A,
    pool: MemoryPool<K, A::Output>,
    downstream: Box<dyn Observer<K, A::Output>>,
    groups: Vec<Group<K, P, A::State>>,
    index: FxHashMap<i32, Vec<usize>>,
    /// Groups holding at least one item.
    active: usize,
    /// Items folded into some group's state.
    windowed: usize,
    next_boundary: Option<Timestamp>,
    guard: DisorderGuard,
    output: Option<Batch<K, A::Output>>,
    windows_emitted: u64,
    terminated: bool,
    completed: bool,
}

impl<K, P, A> HoppingWindow<K, P, A>
where
    K: StreamKey,
    P: Payload,
    A: Aggregate<P>,
{
    pub fn new(
        size: Timestamp,
        hop: Timestamp,
        aggregate: A,
        pool: MemoryPool<K, A::Output>,
        downstream: Box<dyn Observer<K, A::Output>>,
    ) -> Result<Self> {
        if size <= 0 || hop <= 0 {
            return Err(Error::Config(format!(
                "window size and hop must be positive (size {size}, hop {hop})"
            )));
        }
        Ok(Self {
            size,
            hop,
            aggregate,
            pool,
            downstream,
            groups: Vec::new(),
            index: FxHashMap::default(),
            active: 0,
            windowed: 0,
            next_boundary: None,
            guard: DisorderGuard::new(DisorderPolicy::default()),
            output: None,
            windows_emitted: 0,
            terminated: false,
            completed: false,
        })
    }

    pub fn with_disorder_policy(mut self, policy: DisorderPolicy) -> Self {
        self.guard = DisorderGuard::new(policy);
        self
    }

    pub fn active_groups(&self) -> usize {
        self.active
    }

    /// Groups ever seen, including inactive ones.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn windows_emitted(&self) -> u64 {
        self.windows_emitted
    }

    fn group_for(&mut self, key: &K, hash: i32) -> usize {
        let slot = self.index.entry(hash).or_default();
        if let Some(&i) = slot.iter().find(|&&i| self.groups[i].key == *key) {
            return i;
        }
        self.groups.push(Group {
            key: key.clone(),
            hash,
            items: VecDeque::new(),
            included: 0,
            state: A::State::default(),
        });
        let i = self.groups.len() - 1;
        slot.push(i);
        i
    }

    fn insert(&mut self, sync: Timestamp, key: &K, payload: P, hash: i32) {
        let i = self.group_for(key, hash);
        let group = &mut self.groups[i];
        if group.items.is_empty() {
            self.active += 1;
        }
        // everything already included is below the guard, so the new item
        // always lands in the pending tail
        let pos = group.items.partition_point(|(s, _)| *s <= sync);
        group.items.insert(pos, (sync, payload));
        if self.next_boundary.is_none() {
            self.next_boundary = Some(quantize(sync, self.hop).saturating_add(self.hop));
        }
    }

    /// Close every boundary at or before `time`.
    fn advance_to(&mut self, time: Timestamp) {
        while let Some(b) = self.next_boundary {
            if b > time {
                break;
            }
            if self.active == 0 {
                self.next_boundary = None;
                break;
            }
            if self.windowed == 0 {
                // skip empty windows up to the first one holding an item
                let earliest = self
                    .groups
                    .iter()
                    .filter_map(|g| g.items.front().map(|&(s, _)| s))
                    .min();
                if let Some(e) = earliest {
                    let first = quantize(e, self.hop).saturating_add(self.hop);
                    if first > b {
                        self.next_boundary = Some(first);
                        continue;
                    }
                }
            }
            self.close_window(b);
            self.next_boundary = b.checked_add(self.hop);
        }
    }

    fn close_window(&mut self, boundary: Timestamp) {
        let low = boundary.saturating_sub(self.size);
        let end = boundary.saturating_add(self.hop);
        let mut results = Vec::new();
        for group in self.groups.iter_mut().filter(|g| !g.items.is_empty()) {
            while let Some((sync, payload)) = group.items.get(group.included) {
                if *sync >= boundary {
                    break;
                }
                self.aggregate.accumulate(&mut group.state, payload);
                group.included += 1;
                self.windowed += 1;
            }
            while group.items.front().is_some_and(|&(s, _)| s < low) {
                if let Some((_, payload)) = group.items.pop_front() {
                    self.aggregate.deaccumulate(&mut group.state, &payload);
                    group.included -= 1;
                    self.windowed -= 1;
                }
            }
            if group.included > 0 {
                results.push((group.key.clone(), self.aggregate.compute(&group.state), group.hash));
            }
            if group.items.is_empty() {
                group.state = A::State::default();
                self.active -= 1;
            }
        }
        #[cfg(feature = "tracing")]
        tracing::trace!(boundary, windows = results.len(), active = self.active, "window boundary");
        self.windows_emitted += results.len() as u64;
        for (key, value, hash) in results {
            self.emit(|b| b.add_with_hash(boundary, end, key, value, hash));
        }
    }

    fn emit(&mut self, f: impl FnOnce(&mut Batch<K, A::Output>)) {
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

    /// A progress signal at `time`: close due windows, then forward it.
    fn on_progress(&mut self, kind: EventKind, time: Timestamp) -> Result<()> {
        let Some(t) = self.guard.admit_control(time)? else {
            return Ok(());
        };
        self.guard.advance(t);
        self.advance_to(t);
        match kind {
            EventKind::LowWatermark => self.emit(|b| b.add_low_watermark(t)),
            _ => self.emit(|b| b.add_punctuation(t)),
        }
        Ok(())
    }

    fn process(&mut self, batch: &Batch<K, P>) -> Result<()> {
        for row in batch.live_rows() {
            match row.kind {
                None => {}
                Some(EventKind::Punctuation) if K::PARTITIONED => {
                    // partition punctuations pass through; low watermarks drive windows
                    let key = row.key.clone();
                    self.emit(|b| b.add_keyed_punctuation(row.sync, key));
                }
                Some(EventKind::Punctuation) => self.on_progress(EventKind::Punctuation, row.sync)?,
                Some(EventKind::LowWatermark) if K::PARTITIONED => {
                    self.on_progress(EventKind::LowWatermark, row.sync)?
                }
                Some(EventKind::LowWatermark) => {
                    return Err(Error::UnsupportedControlEvent(
                        "low watermark reached a window over an unpartitioned stream".into(),
                    ))
                }
                Some(EventKind::EndEdge) => {
                    return Err(Error::UnsupportedControlEvent(format!(
                        "end edge at {} reached a hopping window",
                        row.sync
                    )))
                }
                Some(EventKind::StartEdge | EventKind::Interval) => {
                    let sync = match self.guard.admit(row.sync, INFINITY)? {
                        Admission::Accept => row.sync,
                        Admission::Adjust(t) => t,
                        Admission::Drop => continue,
                    };
                    self.insert(sync, row.key, row.payload.clone(), row.hash);
                }
            }
        }
        Ok(())
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

impl<K, P, A> Observer<K, P> for HoppingWindow<K, P, A>
where
    K: StreamKey,
    P: Payload,
    A: Aggregate<P>,
{
    fn on_next(&mut self, batch: Batch<K, P>) {
        if self.terminated || self.completed {
            return;
        }
        if let Err(e) = self.process(&batch) {
            self.fail(e);
        }
    }

    fn on_flush(&mut self) {
        if self.terminated {
            return;
        }
        self.push_output();
        self.downstream.on_flush();
    }

    fn on_completed(&mut self) {
        if self.terminated || self.completed {
            return;
        }
        self.advance_to(INFINITY);
        self.push_output();
        self.completed = true;
        self.downstream.on_completed();
    }

    fn on_error(&mut self, error: Error) {
        self.fail(error);
    }
}

impl<K, P, A> Pipe for HoppingWindow<K, P, A>
where
    K: StreamKey + Serialize + DeserializeOwned,
    P: Payload + Serialize + DeserializeOwned,
    A: Aggregate<P>,
    A::Output: Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        "hopping_window"
    }

    fn checkpoint(&self, sink: &mut dyn Write) -> Result<()> {
        let state = WindowCheckpoint {
            groups: self.groups.clone(),
            guard: self.guard.clone(),
            next_boundary: self.next_boundary,
            output: self.output.as_ref().map(Batch::snapshot),
            completed: self.completed,
        };
        write_state(sink, &state)?;
        Ok(())
    }

    fn restore(&mut self, source: &mut dyn Read) -> Result<()> {
        let state: WindowCheckpoint<K, P, A::State, A::Output> = read_state(source)?;
        if let Some(g) = state.groups.iter().find(|g| g.included > g.items.len()) {
            return Err(Error::Checkpoint(format!(
                "group includes {} of {} items",
                g.included,
                g.items.len()
            )));
        }
        self.index.clear();
        for (i, g) in state.groups.iter().enumerate() {
            self.index.entry(g.hash).or_default().push(i);
        }
        self.active = state.groups.iter().filter(|g| !g.items.is_empty()).count();
        self.windowed = state.groups.iter().map(|g| g.included).sum();
        self.groups = state.groups;
        self.guard = state.guard;
        self.next_boundary = state.next_boundary;
        self.output = state
            .output
            .map(|snap| self.pool.restore(snap))
            .transpose()?;
        self.completed = state.completed;
        self.terminated = false;
        Ok(())
    }

    fn produce_query_plan(&self, previous: Vec<PlanNode>) -> PlanNode {
        PlanNode::new(self.name())
            .with_inputs(previous)
            .with_detail("size", self.size)
            .with_detail("hop", self.hop)
            .with_detail("aggregate", self.aggregate.name())
    }
}
