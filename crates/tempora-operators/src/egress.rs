//! Egress boundary: batches in, change records out.
//!
//! - start edge: `Insert` at `sync`
//! - interval `[sync, other)`: `Insert` at `sync`, `Delete` held back until
//!   time reaches `other`
//! - end edge: `Delete` at `sync` in changelog mode; an insert-only egress
//!   cannot represent it and fails with `UnsupportedControlEvent`
//!
//! Held-back deletes are released in time order, before any row or
//! punctuation at or after their time.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use tempora_core::error::{Error, Result};
use tempora_core::time::{EventKind, Timestamp, INFINITY};
use tempora_core::types::{Payload, StreamKey};
use tempora_mem::checkpoint::{read_state, write_state};
use tempora_mem::Batch;

use crate::plan::PlanNode;
use crate::traits::{Observer, Pipe};

/// One record handed to the external consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<K, P> {
    Insert { time: Timestamp, key: K, payload: P },
    Delete { time: Timestamp, key: K, payload: P },
    Punctuation(Timestamp),
    LowWatermark(Timestamp),
    Error(Error),
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EgressMode {
    /// Only insertions (and the deletes implied by intervals) are expressible.
    #[default]
    InsertOnly,
    /// End edges become explicit deletes.
    Changelog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingDelete<K, P> {
    time: Timestamp,
    seq: u64,
    key: K,
    payload: P,
}

impl<K, P> PartialEq for PendingDelete<K, P> {
    fn eq(&self, other: &Self) -> bool {
        (self.time, self.seq) == (other.time, other.seq)
    }
}

impl<K, P> Eq for PendingDelete<K, P> {}

impl<K, P> PartialOrd for PendingDelete<K, P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K, P> Ord for PendingDelete<K, P> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.time, self.seq).cmp(&(other.time, other.seq))
    }
}

#[derive(Serialize, Deserialize)]
struct EgressCheckpoint<K, P> {
    pending: Vec<PendingDelete<K, P>>,
    seq: u64,
    terminated: bool,
}

type Sink<K, P> = Box<dyn FnMut(Change<K, P>) + Send>;

pub struct Egress<K: StreamKey, P: Payload> {
    mode: EgressMode,
    pending: BinaryHeap<Reverse<PendingDelete<K, P>>>,
    seq: u64,
    sink: Sink<K, P>,
    terminated: bool,
}

impl<K: StreamKey, P: Payload> Egress<K, P> {
    pub fn new(mode: EgressMode, sink: impl FnMut(Change<K, P>) + Send + 'static) -> Self {
        Self {
            mode,
            pending: BinaryHeap::new(),
            seq: 0,
            sink: Box::new(sink),
            terminated: false,
        }
    }

    /// An egress that appends every change to a shared vector.
    pub fn collecting(mode: EgressMode) -> (Self, Arc<Mutex<Vec<Change<K, P>>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink_out = Arc::clone(&out);
        let egress = Self::new(mode, move |change| {
            sink_out
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(change)
        });
        (egress, out)
    }

    pub fn mode(&self) -> EgressMode {
        self.mode
    }

    /// Deletes scheduled but not yet released.
    pub fn pending_deletes(&self) -> usize {
        self.pending.len()
    }

    fn release(&mut self, upto: Timestamp) {
        while self.pending.peek().is_some_and(|Reverse(d)| d.time <= upto) {
            if let Some(Reverse(d)) = self.pending.pop() {
                (self.sink)(Change::Delete {
                    time: d.time,
                    key: d.key,
                    payload: d.payload,
                });
            }
        }
    }

    fn schedule_delete(&mut self, time: Timestamp, key: K, payload: P) {
        self.seq += 1;
        self.pending.push(Reverse(PendingDelete {
            time,
            seq: self.seq,
            key,
            payload,
        }));
    }

    fn fail(&mut self, error: Error) {
        self.terminated = true;
        (self.sink)(Change::Error(error));
    }
}

impl<K: StreamKey, P: Payload> Observer<K, P> for Egress<K, P> {
    fn on_next(&mut self, batch: Batch<K, P>) {
        if self.terminated {
            return;
        }
        for row in batch.live_rows() {
            let Some(kind) = row.kind else { continue };
            self.release(row.sync);
            match kind {
                EventKind::StartEdge => (self.sink)(Change::Insert {
                    time: row.sync,
                    key: row.key.clone(),
                    payload: row.payload.clone(),
                }),
                EventKind::Interval => {
                    (self.sink)(Change::Insert {
                        time: row.sync,
                        key: row.key.clone(),
                        payload: row.payload.clone(),
                    });
                    self.schedule_delete(row.other, row.key.clone(), row.payload.clone());
                }
                EventKind::EndEdge => match self.mode {
                    EgressMode::InsertOnly => {
                        self.fail(Error::UnsupportedControlEvent(format!(
                            "end edge at {} (start {}) reached an insert-only egress",
                            row.sync, row.other
                        )));
                        return;
                    }
                    EgressMode::Changelog => (self.sink)(Change::Delete {
                        time: row.sync,
                        key: row.key.clone(),
                        payload: row.payload.clone(),
                    }),
                },
                EventKind::Punctuation => (self.sink)(Change::Punctuation(row.sync)),
                EventKind::LowWatermark => (self.sink)(Change::LowWatermark(row.sync)),
            }
        }
    }

    fn on_flush(&mut self) {}

    fn on_completed(&mut self) {
        if self.terminated {
            return;
        }
        self.release(INFINITY);
        (self.sink)(Change::Completed);
    }

    fn on_error(&mut self, error: Error) {
        if !self.terminated {
            self.fail(error);
        }
    }
}

impl<K, P> Pipe for Egress<K, P>
where
    K: StreamKey + Serialize + DeserializeOwned,
    P: Payload + Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        "egress"
    }

    fn checkpoint(&self, sink: &mut dyn Write) -> Result<()> {
        let mut pending: Vec<PendingDelete<K, P>> =
            self.pending.iter().map(|Reverse(d)| d.clone()).collect();
        pending.sort();
        write_state(
            sink,
            &EgressCheckpoint {
                pending,
                seq: self.seq,
                terminated: self.terminated,
            },
        )?;
        Ok(())
    }

    fn restore(&mut self, source: &mut dyn Read) -> Result<()> {
        let state: EgressCheckpoint<K, P> = read_state(source)?;
        self.pending = state.pending.into_iter().map(Reverse).collect();
        self.seq = state.seq;
        self.terminated = state.terminated;
        Ok(())
    }

    fn produce_query_plan(&self, previous: Vec<PlanNode>) -> PlanNode {
        PlanNode::new(self.name())
            .with_inputs(previous)
            .with_detail("mode", format!("{:?}", self.mode))
    }
}
