//! Ingress, punctuation merging and the disjoint union, wired by hand.

use std::sync::{Arc, Mutex};

use tempora_core::error::Error;
use tempora_core::policy::{DisorderPolicy, FlushPolicy};
use tempora_core::time::{Timestamp, INFINITY};
use tempora_core::types::PartitionKey;
use tempora_mem::MemoryPool;
use tempora_operators::{
    BinaryInput, Change, DisjointUnion, Egress, EgressMode, Ingress, StreamEvent, UnionMode,
};

type Changes<K, P> = Arc<Mutex<Vec<Change<K, P>>>>;

fn inserted<K: Clone, P: Clone>(changes: &Changes<K, P>) -> Vec<(Timestamp, K, P)> {
    changes
        .lock()
        .unwrap()
        .iter()
        .filter_map(|c| match c {
            Change::Insert { time, key, payload } => Some((*time, key.clone(), payload.clone())),
            _ => None,
        })
        .collect()
}

fn punctuations<K, P>(changes: &Changes<K, P>) -> Vec<Timestamp> {
    changes
        .lock()
        .unwrap()
        .iter()
        .filter_map(|c| match c {
            Change::Punctuation(t) => Some(*t),
            _ => None,
        })
        .collect()
}

fn low_watermarks<K, P>(changes: &Changes<K, P>) -> Vec<Timestamp> {
    changes
        .lock()
        .unwrap()
        .iter()
        .filter_map(|c| match c {
            Change::LowWatermark(t) => Some(*t),
            _ => None,
        })
        .collect()
}

#[test]
fn union_merges_two_ingresses_in_sync_order() {
    let (egress, changes) = Egress::<u32, i64>::collecting(EgressMode::InsertOnly);
    let union = DisjointUnion::new(MemoryPool::standalone(8), Box::new(egress));
    assert_eq!(union.mode(), UnionMode::Merge);
    let (shared, left, right) = BinaryInput::pair(union);

    let mut l = Ingress::new(MemoryPool::<u32, i64>::standalone(8), Box::new(left));
    let mut r = Ingress::new(MemoryPool::<u32, i64>::standalone(8), Box::new(right));

    l.push_all([
        StreamEvent::start(1, 1, 10),
        StreamEvent::start(4, 1, 40),
        StreamEvent::punctuation(5),
    ])
    .unwrap();
    assert!(inserted(&changes).is_empty(), "right side has not punctuated yet");

    r.push_all([
        StreamEvent::start(2, 2, 20),
        StreamEvent::start(3, 2, 30),
        StreamEvent::punctuation(10),
    ])
    .unwrap();
    l.push_all([StreamEvent::start(6, 1, 60), StreamEvent::punctuation(12)])
        .unwrap();
    r.push(StreamEvent::start(11, 2, 110)).unwrap();
    r.complete().unwrap();
    l.complete().unwrap();

    let times: Vec<Timestamp> = inserted(&changes).iter().map(|(t, _, _)| *t).collect();
    assert_eq!(times, vec![1, 2, 3, 4, 6, 11]);
    assert_eq!(punctuations(&changes), vec![5, 10, 12, INFINITY]);
    assert_eq!(changes.lock().unwrap().last(), Some(&Change::Completed));
    assert_eq!(shared.lock().unwrap().buffered(), 0);
}

#[test]
fn out_of_order_input_is_reported_downstream() {
    let (egress, changes) = Egress::<u32, i64>::collecting(EgressMode::InsertOnly);
    let mut ingress = Ingress::new(MemoryPool::standalone(8), Box::new(egress));

    ingress.push(StreamEvent::start(5, 1, 1)).unwrap();
    let err = ingress.push(StreamEvent::start(3, 1, 2)).unwrap_err();
    assert_eq!(
        err,
        Error::OutOfOrder {
            sync: 3,
            watermark: 5
        }
    );
    assert!(ingress.is_terminated());
    assert!(ingress.push(StreamEvent::start(6, 1, 3)).is_err());
    assert_eq!(
        changes.lock().unwrap().last(),
        Some(&Change::Error(Error::OutOfOrder {
            sync: 3,
            watermark: 5
        }))
    );
}

#[test]
fn drop_policy_discards_late_rows() {
    let (egress, changes) = Egress::<u32, i64>::collecting(EgressMode::InsertOnly);
    let ingress = Ingress::new(MemoryPool::standalone(8), Box::new(egress))
        .with_disorder_policy(DisorderPolicy::Drop);

    ingress
        .run([
            StreamEvent::start(5, 1, 1),
            StreamEvent::start(3, 1, 2),
            StreamEvent::punctuation(4),
            StreamEvent::start(7, 1, 3),
        ])
        .unwrap();

    assert_eq!(inserted(&changes), vec![(5, 1, 1), (7, 1, 3)]);
    assert_eq!(punctuations(&changes), vec![5, INFINITY]);
}

#[test]
fn partitioned_union_passes_batches_through() {
    type K = PartitionKey<u32>;
    let (egress, changes) = Egress::<K, i64>::collecting(EgressMode::InsertOnly);
    let union = DisjointUnion::new(MemoryPool::standalone(8), Box::new(egress));
    assert_eq!(union.mode(), UnionMode::PassThrough);
    let (_shared, left, right) = BinaryInput::pair(union);

    let mut l = Ingress::new(MemoryPool::<K, i64>::standalone(8), Box::new(left))
        .with_flush_policy(FlushPolicy::FlushOnLowWatermark);
    let mut r = Ingress::new(MemoryPool::<K, i64>::standalone(8), Box::new(right))
        .with_flush_policy(FlushPolicy::FlushOnLowWatermark);

    l.push_all([
        StreamEvent::start(5, PartitionKey(1), 50),
        StreamEvent::low_watermark(3),
    ])
    .unwrap();
    r.push_all([
        StreamEvent::start(2, PartitionKey(2), 20),
        StreamEvent::low_watermark(4),
    ])
    .unwrap();
    l.complete().unwrap();
    r.complete().unwrap();

    assert_eq!(
        inserted(&changes),
        vec![(5, PartitionKey(1), 50), (2, PartitionKey(2), 20)]
    );
    assert_eq!(low_watermarks(&changes), vec![3, 4, INFINITY]);
    assert_eq!(changes.lock().unwrap().last(), Some(&Change::Completed));
}
