//! Ingress boundary: external events in, batches out.
//!
//! The ingress is where event-time discipline is enforced. Rows must arrive
//! with non-decreasing sync times (per partition for partitioned streams);
//! anything else is handled by the configured `DisorderPolicy`. Punctuations
//! are emitted when the producer supplies them, when the periodic policy says
//! so, and once at infinity on completion.

use std::io::{Read, Write};

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use tempora_core::config::EngineConfig;
use tempora_core::error::{Error, Result};
use tempora_core::policy::{DisorderPolicy, FlushPolicy, PeriodicPunctuationPolicy};
use tempora_core::time::{is_control_time, Timestamp, INFINITY, MIN_SYNC_TIME};
use tempora_core::types::{Payload, StreamKey};
use tempora_mem::checkpoint::{read_state, write_state, BatchSnapshot};
use tempora_mem::{Batch, MemoryPool};

use crate::plan::PlanNode;
use crate::punctuation::{Admission, DisorderGuard, PeriodicPunctuation};
use crate::traits::{Observer, Pipe};

/// One external event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent<K, P> {
    /// Open-ended event starting at `sync`.
    Start { sync: Timestamp, key: K, payload: P },
    /// Event valid over `[sync, other)`.
    Interval {
        sync: Timestamp,
        other: Timestamp,
        key: K,
        payload: P,
    },
    /// Closes the event that started at `start`.
    End {
        sync: Timestamp,
        start: Timestamp,
        key: K,
        payload: P,
    },
    /// No later row carries a smaller sync time.
    Punctuation { time: Timestamp },
    /// Punctuation for one partition of a partitioned stream.
    PartitionPunctuation { key: K, time: Timestamp },
    /// Punctuation across all partitions of a partitioned stream.
    LowWatermark { time: Timestamp },
}

impl<K, P> StreamEvent<K, P> {
    pub fn start(sync: Timestamp, key: K, payload: P) -> Self {
        StreamEvent::Start { sync, key, payload }
    }

    pub fn interval(sync: Timestamp, other: Timestamp, key: K, payload: P) -> Self {
        StreamEvent::Interval {
            sync,
            other,
            key,
            payload,
        }
    }

    /// A unit-length interval `[sync, sync + 1)`.
    pub fn point(sync: Timestamp, key: K, payload: P) -> Self {
        Self::interval(sync, sync.saturating_add(1), key, payload)
    }

    pub fn end(sync: Timestamp, start: Timestamp, key: K, payload: P) -> Self {
        StreamEvent::End {
            sync,
            start,
            key,
            payload,
        }
    }

    pub fn punctuation(time: Timestamp) -> Self {
        StreamEvent::Punctuation { time }
    }

    pub fn low_watermark(time: Timestamp) -> Self {
        StreamEvent::LowWatermark { time }
    }
}

/// Disorder state of one ordered (sub)stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lane {
    data: DisorderGuard,
    punctuation: DisorderGuard,
}

impl Lane {
    fn new(policy: DisorderPolicy, floor: Timestamp) -> Self {
        let mut data = DisorderGuard::new(policy);
        data.advance(floor);
        Self {
            data,
            punctuation: DisorderGuard::new(policy),
        }
    }

    /// Punctuations may not regress; one below the data watermark is raised
    /// to it so the batch stays ordered.
    fn admit_punctuation(&mut self, time: Timestamp) -> Result<Option<Timestamp>> {
        let Some(t) = self.punctuation.admit_control(time)? else {
            return Ok(None);
        };
        let t = t.max(self.data.watermark());
        self.punctuation.advance(t);
        self.data.advance(t);
        Ok(Some(t))
    }
}

#[derive(Serialize, Deserialize)]
struct IngressCheckpoint<K, P> {
    lane: Lane,
    partitions: Vec<(K, Lane)>,
    low_watermark: DisorderGuard,
    periodic: PeriodicPunctuation,
    pending: Option<BatchSnapshot<K, P>>,
    completed: bool,
}

pub struct Ingress<K: StreamKey, P: Payload> {
    pool: MemoryPool<K, P>,
    downstream: Box<dyn Observer<K, P>>,
    current: Option<Batch<K, P>>,
    policy: DisorderPolicy,
    flush_policy: FlushPolicy,
    lane: Lane,
    partitions: FxHashMap<K, Lane>,
    low_watermark: DisorderGuard,
    periodic: PeriodicPunctuation,
    terminated: Option<Error>,
    completed: bool,
    batches_pushed: u64,
}

impl<K: StreamKey, P: Payload> Ingress<K, P> {
    /// Ingress with default policies (throw on disorder, no periodic
    /// punctuation, flush on punctuation).
    pub fn new(pool: MemoryPool<K, P>, downstream: Box<dyn Observer<K, P>>) -> Self {
        let policy = DisorderPolicy::default();
        Self {
            pool,
            downstream,
            current: None,
            policy,
            flush_policy: FlushPolicy::default(),
            lane: Lane::new(policy, MIN_SYNC_TIME),
            partitions: FxHashMap::default(),
            low_watermark: DisorderGuard::new(policy),
            periodic: PeriodicPunctuation::new(PeriodicPunctuationPolicy::None),
            terminated: None,
            completed: false,
            batches_pushed: 0,
        }
    }

    /// Ingress with the policies from `cfg`.
    pub fn from_config(
        pool: MemoryPool<K, P>,
        cfg: &EngineConfig,
        downstream: Box<dyn Observer<K, P>>,
    ) -> Self {
        Self::new(pool, downstream)
            .with_disorder_policy(cfg.disorder_policy)
            .with_punctuation_policy(cfg.punctuation_policy)
            .with_flush_policy(cfg.flush_policy)
    }

    pub fn with_disorder_policy(mut self, policy: DisorderPolicy) -> Self {
        self.policy = policy;
        self.lane = Lane::new(policy, MIN_SYNC_TIME);
        self.low_watermark = DisorderGuard::new(policy);
        self
    }

    pub fn with_punctuation_policy(mut self, policy: PeriodicPunctuationPolicy) -> Self {
        self.periodic = PeriodicPunctuation::new(policy);
        self
    }

    pub fn with_flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.flush_policy = policy;
        self
    }

    pub fn batches_pushed(&self) -> u64 {
        self.batches_pushed
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_some()
    }

    /// Feed one event. A returned error has also been sent to `on_error` and
    /// terminates the subscription; every later call returns it again.
    pub fn push(&mut self, event: StreamEvent<K, P>) -> Result<()> {
        self.ensure_open()?;
        let res = self.dispatch(event);
        if let Err(e) = &res {
            self.fail(e.clone());
        }
        res
    }

    pub fn push_all<I>(&mut self, events: I) -> Result<()>
    where
        I: IntoIterator<Item = StreamEvent<K, P>>,
    {
        for event in events {
            self.push(event)?;
        }
        Ok(())
    }

    /// Feed every event, then complete.
    pub fn run<I>(mut self, events: I) -> Result<()>
    where
        I: IntoIterator<Item = StreamEvent<K, P>>,
    {
        self.push_all(events)?;
        self.complete()
    }

    /// Push the partial batch and flush downstream.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        let res = self.flush_inner();
        if let Err(e) = &res {
            self.fail(e.clone());
        }
        res
    }

    /// Emit the final punctuation (low watermark for partitioned streams) at
    /// infinity and complete downstream.
    pub fn complete(&mut self) -> Result<()> {
        if let Some(e) = &self.terminated {
            return Err(e.clone());
        }
        if self.completed {
            return Ok(());
        }
        let res = self.finish();
        if let Err(e) = &res {
            self.fail(e.clone());
            return res;
        }
        self.completed = true;
        self.downstream.on_completed();
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if K::PARTITIONED {
            self.append(|b| b.add_low_watermark(INFINITY))?;
        } else {
            self.append(|b| b.add_punctuation(INFINITY))?;
        }
        self.push_current()
    }

    fn ensure_open(&self) -> Result<()> {
        if let Some(e) = &self.terminated {
            return Err(e.clone());
        }
        if self.completed {
            return Err(Error::Invariant("ingress already completed".into()));
        }
        Ok(())
    }

    fn fail(&mut self, error: Error) {
        // rows admitted before the failure are still valid output
        if let Some(mut batch) = self.current.take() {
            if !batch.is_empty() && batch.seal().is_ok() {
                self.downstream.on_next(batch);
            }
        }
        self.downstream.on_error(error.clone());
        self.terminated = Some(error);
    }

    fn dispatch(&mut self, event: StreamEvent<K, P>) -> Result<()> {
        match event {
            StreamEvent::Start { sync, key, payload } => self.on_data(sync, INFINITY, key, payload),
            StreamEvent::Interval {
                sync,
                other,
                key,
                payload,
            } => {
                if other < sync {
                    return Err(Error::Invariant(format!(
                        "interval [{sync}, {other}) ends before it starts"
                    )));
                }
                self.on_data(sync, other, key, payload)
            }
            StreamEvent::End {
                sync,
                start,
                key,
                payload,
            } => {
                if start >= sync || is_control_time(start) {
                    return Err(Error::Invariant(format!(
                        "end edge at {sync} cannot close an event starting at {start}"
                    )));
                }
                self.on_data(sync, start, key, payload)
            }
            StreamEvent::Punctuation { time } => {
                if K::PARTITIONED {
                    return Err(Error::UnsupportedControlEvent(
                        "global punctuation on a partitioned stream".into(),
                    ));
                }
                self.on_punctuation(None, time)
            }
            StreamEvent::PartitionPunctuation { key, time } => {
                if !K::PARTITIONED {
                    return Err(Error::UnsupportedControlEvent(
                        "partition punctuation on an unpartitioned stream".into(),
                    ));
                }
                self.on_punctuation(Some(key), time)
            }
            StreamEvent::LowWatermark { time } => {
                if !K::PARTITIONED {
                    return Err(Error::UnsupportedControlEvent(
                        "low watermark on an unpartitioned stream".into(),
                    ));
                }
                self.on_low_watermark(time)
            }
        }
    }

    fn lane_mut(&mut self, key: Option<&K>) -> &mut Lane {
        match key {
            Some(k) if K::PARTITIONED => {
                let (policy, floor) = (self.policy, self.low_watermark.watermark());
                self.partitions
                    .entry(k.clone())
                    .or_insert_with(|| Lane::new(policy, floor))
            }
            _ => &mut self.lane,
        }
    }

    fn on_data(&mut self, sync: Timestamp, other: Timestamp, key: K, payload: P) -> Result<()> {
        let sync = match self.lane_mut(Some(&key)).data.admit(sync, other)? {
            Admission::Accept => sync,
            Admission::Adjust(t) => t,
            Admission::Drop => return Ok(()),
        };
        if !K::PARTITIONED {
            if let Some(p) = self.periodic.observe(sync) {
                self.on_punctuation(None, p)?;
            }
        }
        self.lane_mut(Some(&key)).data.advance(sync);
        self.append(|b| b.add(sync, other, key, payload))
    }

    fn on_punctuation(&mut self, key: Option<K>, time: Timestamp) -> Result<()> {
        let Some(t) = self.lane_mut(key.as_ref()).admit_punctuation(time)? else {
            return Ok(());
        };
        match key {
            Some(k) => self.append(|b| b.add_keyed_punctuation(t, k))?,
            None => {
                self.periodic.note(t);
                self.append(|b| b.add_punctuation(t))?
            }
        }
        if self.flush_policy == FlushPolicy::FlushOnPunctuation {
            self.flush_inner()?;
        }
        Ok(())
    }

    fn on_low_watermark(&mut self, time: Timestamp) -> Result<()> {
        let Some(t) = self.low_watermark.admit_control(time)? else {
            return Ok(());
        };
        self.low_watermark.advance(t);
        for lane in self.partitions.values_mut() {
            lane.data.advance(t);
        }
        self.append(|b| b.add_low_watermark(t))?;
        if self.flush_policy == FlushPolicy::FlushOnLowWatermark {
            self.flush_inner()?;
        }
        Ok(())
    }

    fn append(&mut self, f: impl FnOnce(&mut Batch<K, P>)) -> Result<()> {
        if self.current.as_ref().is_some_and(Batch::is_full) {
            self.push_current()?;
        }
        let pool = &self.pool;
        let batch = self.current.get_or_insert_with(|| pool.get());
        f(batch);
        Ok(())
    }

    fn push_current(&mut self) -> Result<()> {
        let Some(mut batch) = self.current.take() else {
            return Ok(());
        };
        if batch.is_empty() {
            return Ok(());
        }
        batch.seal()?;
        self.batches_pushed += 1;
        self.downstream.on_next(batch);
        if self.flush_policy == FlushPolicy::FlushOnBatchBoundary {
            self.downstream.on_flush();
        }
        Ok(())
    }

    fn flush_inner(&mut self) -> Result<()> {
        self.push_current()?;
        self.downstream.on_flush();
        self.pool.advance_generation();
        Ok(())
    }
}

impl<K, P> Pipe for Ingress<K, P>
where
    K: StreamKey + Serialize + DeserializeOwned,
    P: Payload + Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        "ingress"
    }

    fn checkpoint(&self, sink: &mut dyn Write) -> Result<()> {
        let state = IngressCheckpoint {
            lane: self.lane.clone(),
            partitions: self
                .partitions
                .iter()
                .map(|(k, lane)| (k.clone(), lane.clone()))
                .collect(),
            low_watermark: self.low_watermark.clone(),
            periodic: self.periodic.clone(),
            pending: self.current.as_ref().map(Batch::snapshot),
            completed: self.completed,
        };
        write_state(sink, &state)?;
        Ok(())
    }

    fn restore(&mut self, source: &mut dyn Read) -> Result<()> {
        let state: IngressCheckpoint<K, P> = read_state(source)?;
        self.lane = state.lane;
        self.partitions = state.partitions.into_iter().collect();
        self.low_watermark = state.low_watermark;
        self.periodic = state.periodic;
        self.current = state
            .pending
            .map(|snap| self.pool.restore(snap))
            .transpose()?;
        self.completed = state.completed;
        self.terminated = None;
        Ok(())
    }

    fn produce_query_plan(&self, previous: Vec<PlanNode>) -> PlanNode {
        PlanNode::new(self.name())
            .with_inputs(previous)
            .with_detail("batch_size", self.pool.batch_size())
            .with_detail("disorder", self.policy)
            .with_detail("flush", format!("{:?}", self.flush_policy))
    }
}
