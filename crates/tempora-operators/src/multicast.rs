//! Fan a stream out to several consumers.
//!
//! Every consumer but the last gets a shallow share of the batch and the last
//! one gets the original, so no column is copied here. A consumer that wants
//! to modify a column copies it on write.

use tempora_core::error::Error;
use tempora_core::types::{Payload, StreamKey};
use tempora_mem::Batch;

use crate::plan::PlanNode;
use crate::traits::{Observer, Pipe};

pub struct Multicast<K: StreamKey, P: Payload> {
    outputs: Vec<Box<dyn Observer<K, P>>>,
}

impl<K: StreamKey, P: Payload> Multicast<K, P> {
    pub fn new(outputs: Vec<Box<dyn Observer<K, P>>>) -> Self {
        Self { outputs }
    }

    pub fn add_output(&mut self, output: Box<dyn Observer<K, P>>) {
        self.outputs.push(output);
    }

    pub fn fan_out(&self) -> usize {
        self.outputs.len()
    }
}

impl<K: StreamKey, P: Payload> Observer<K, P> for Multicast<K, P> {
    fn on_next(&mut self, batch: Batch<K, P>) {
        let Some((last, rest)) = self.outputs.split_last_mut() else {
            return;
        };
        for out in rest {
            out.on_next(batch.share());
        }
        last.on_next(batch);
    }

    fn on_flush(&mut self) {
        for out in &mut self.outputs {
            out.on_flush();
        }
    }

    fn on_completed(&mut self) {
        for out in &mut self.outputs {
            out.on_completed();
        }
    }

    fn on_error(&mut self, error: Error) {
        for out in &mut self.outputs {
            out.on_error(error.clone());
        }
    }
}

impl<K: StreamKey, P: Payload> Pipe for Multicast<K, P> {
    fn name(&self) -> &'static str {
        "multicast"
    }

    fn produce_query_plan(&self, previous: Vec<PlanNode>) -> PlanNode {
        PlanNode::new(self.name())
            .with_inputs(previous)
            .with_detail("outputs", self.outputs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Where;
    use crate::testing::{collector, data_rows};
    use tempora_core::time::INFINITY;
    use tempora_mem::MemoryPool;

    #[test]
    fn each_output_sees_the_batch_and_columns_return_once() {
        let pool = MemoryPool::<u32, i64>::standalone(4);
        let (a, log_a) = collector();
        let (b, log_b) = collector();
        let evens: Box<dyn Observer<u32, i64>> =
            Box::new(Where::new(|_: &u32, p: &i64| p % 2 == 0, b));
        let mut mc = Multicast::new(vec![evens, a]);

        let mut batch = pool.get();
        batch.add(1, INFINITY, 0, 1);
        batch.add(2, INFINITY, 0, 2);
        mc.on_next(batch);
        mc.on_completed();

        assert_eq!(data_rows(&log_a).len(), 2);
        assert_eq!(data_rows(&log_b), vec![(2, INFINITY, 2)]);
        assert_eq!(pool.batches_outstanding(), 0);
        let s = pool.stats();
        assert_eq!(s.time.returned, s.time.rented);
        assert_eq!(s.bitvectors.rented, 2, "only the filtered branch copied its bit-vector");
    }
}
