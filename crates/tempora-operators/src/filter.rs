//! Where filter.
//!
//! Rejected rows are not compacted away. They are marked deleted in the
//! bit-vector, which is the only column the filter writes; every other column
//! keeps being shared with whoever else holds the batch.

use tempora_core::error::Error;
use tempora_core::types::{Payload, StreamKey};
use tempora_mem::Batch;

use crate::plan::PlanNode;
use crate::traits::{Observer, Pipe};

pub struct Where<K: StreamKey, P: Payload, F> {
    predicate: F,
    downstream: Box<dyn Observer<K, P>>,
    /// Free-form description for query plans.
    label: String,
    rows_rejected: u64,
}

impl<K, P, F> Where<K, P, F>
where
    K: StreamKey,
    P: Payload,
    F: FnMut(&K, &P) -> bool + Send,
{
    pub fn new(predicate: F, downstream: Box<dyn Observer<K, P>>) -> Self {
        Self {
            predicate,
            downstream,
            label: "closure".into(),
            rows_rejected: 0,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn rows_rejected(&self) -> u64 {
        self.rows_rejected
    }
}

impl<K, P, F> Observer<K, P> for Where<K, P, F>
where
    K: StreamKey,
    P: Payload,
    F: FnMut(&K, &P) -> bool + Send,
{
    fn on_next(&mut self, mut batch: Batch<K, P>) {
        let rejected: Vec<usize> = batch
            .live_rows()
            .filter(|r| r.kind.is_some_and(|k| k.is_data()))
            .filter(|r| !(self.predicate)(r.key, r.payload))
            .map(|r| r.index)
            .collect();
        for &row in &rejected {
            batch.set_deleted(row);
        }
        self.rows_rejected += rejected.len() as u64;

        if batch.live_rows().next().is_some() {
            self.downstream.on_next(batch);
        }
    }

    fn on_flush(&mut self) {
        self.downstream.on_flush();
    }

    fn on_completed(&mut self) {
        self.downstream.on_completed();
    }

    fn on_error(&mut self, error: Error) {
        self.downstream.on_error(error);
    }
}

impl<K, P, F> Pipe for Where<K, P, F>
where
    K: StreamKey,
    P: Payload,
    F: FnMut(&K, &P) -> bool + Send,
{
    fn name(&self) -> &'static str {
        "where"
    }

    fn produce_query_plan(&self, previous: Vec<PlanNode>) -> PlanNode {
        PlanNode::new(self.name())
            .with_inputs(previous)
            .with_detail("predicate", &self.label)
    }
}
