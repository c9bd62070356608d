//! Batch and pool behaviour through the public tempora-mem API.

use tempora_core::time::{EventKind, INFINITY, PUNCTUATION_TIME};
use tempora_mem::{read_state, write_state, Batch, BatchSnapshot, MemoryPool, PoolRegistry};

fn filled(pool: &MemoryPool<u32, i64>, rows: &[(i64, i64, u32, i64)]) -> Batch<u32, i64> {
    let mut b = pool.get();
    for &(sync, other, key, payload) in rows {
        b.add(sync, other, key, payload);
    }
    b
}

#[test]
fn freed_batches_come_back_to_the_pool() {
    let pool = MemoryPool::<u32, i64>::standalone(4);
    let b = filled(&pool, &[(1, INFINITY, 1, 10), (2, 3, 2, 20)]);
    assert_eq!(pool.batches_outstanding(), 1);
    b.free();
    assert_eq!(pool.batches_outstanding(), 0);

    let stats = pool.stats();
    assert_eq!(stats.time.returned, 2);
    assert_eq!(stats.time.outstanding, 0);

    // the second rental reuses the returned buffers
    let again = pool.get();
    assert!(again.is_empty());
    assert_eq!(pool.stats().time.allocated, stats.time.allocated);
}

#[test]
fn shared_batches_copy_on_write() {
    let pool = MemoryPool::<u32, i64>::standalone(8);
    let mut original = filled(&pool, &[(1, INFINITY, 1, 10), (2, INFINITY, 1, 20)]);
    original.seal().unwrap();

    let mut copy = original.share();
    copy.set_payload(1, 99);
    copy.set_deleted(0);

    assert_eq!(*original.payload(1), 20);
    assert!(!original.is_deleted(0));
    assert_eq!(*copy.payload(1), 99);
    assert!(copy.is_tombstone(0));
    assert_eq!(copy.live_rows().count(), 1);

    original.free();
    copy.free();
    assert_eq!(pool.batches_outstanding(), 0);
}

#[test]
fn control_rows_are_classified_and_never_tombstones() {
    let pool = MemoryPool::<u32, i64>::standalone(8);
    let mut b = filled(&pool, &[(1, INFINITY, 1, 10), (3, 1, 1, 10)]);
    b.add_punctuation(5);
    b.add_low_watermark(6);

    assert_eq!(b.row_kind(0), Some(EventKind::StartEdge));
    assert_eq!(b.row_kind(1), Some(EventKind::EndEdge));
    assert_eq!(b.row_kind(2), Some(EventKind::Punctuation));
    assert_eq!(b.row_kind(3), Some(EventKind::LowWatermark));
    assert_eq!(b.other(2), PUNCTUATION_TIME);
    assert!(b.is_deleted(2));
    assert!(!b.is_tombstone(2));
    assert_eq!(b.live_rows().count(), 4);
}

#[test]
fn seal_rejects_descending_sync_times() {
    let pool = MemoryPool::<u32, i64>::standalone(8);
    let mut b = filled(&pool, &[(5, INFINITY, 1, 1), (4, INFINITY, 1, 2)]);
    let err = b.seal().unwrap_err();
    assert_eq!(
        err,
        tempora_core::error::Error::OutOfOrder {
            sync: 4,
            watermark: 5
        }
    );
}

#[test]
fn registry_hands_out_one_pool_per_type_pair() {
    let registry = PoolRegistry::new(32, 4);
    let a = registry.memory_pool::<u32, i64>();
    let b = registry.memory_pool::<u32, i64>();
    assert!(a.same_pool(&b));
    assert_eq!(a.batch_size(), 32);

    let batch = a.get();
    assert_eq!(b.batches_outstanding(), 1);
    drop(batch);
    assert_eq!(b.batches_outstanding(), 0);
}

#[test]
fn batch_snapshots_survive_a_checkpoint_frame() {
    let pool = MemoryPool::<u32, String>::standalone(8);
    let mut b = pool.get();
    b.add(1, INFINITY, 7, "a".into());
    b.add(2, 4, 8, "b".into());
    b.add_punctuation(3);
    b.set_deleted(1);

    let mut buf = Vec::new();
    write_state(&mut buf, &b.snapshot()).unwrap();
    let snap: BatchSnapshot<u32, String> = read_state(&mut buf.as_slice()).unwrap();
    let back = pool.restore(snap).unwrap();

    assert_eq!(back.len(), 3);
    assert_eq!(back.vsync(), b.vsync());
    assert_eq!(back.vother(), b.vother());
    assert_eq!(back.hashes(), b.hashes());
    assert!(back.is_tombstone(1));
    assert_eq!(back.row_kind(2), Some(EventKind::Punctuation));
}

#[test]
fn corrupted_frames_are_rejected() {
    let mut buf = Vec::new();
    write_state(&mut buf, &vec![1u64, 2, 3]).unwrap();

    let mut flipped = buf.clone();
    let last = flipped.len() - 1;
    flipped[last] ^= 0xff;
    let err = read_state::<Vec<u64>>(&mut flipped.as_slice()).unwrap_err();
    assert!(matches!(err, tempora_mem::error::Error::ChecksumMismatch));

    let mut bad_magic = buf;
    bad_magic[0] ^= 0xff;
    let err = read_state::<Vec<u64>>(&mut bad_magic.as_slice()).unwrap_err();
    assert!(matches!(err, tempora_mem::error::Error::BadHeader(_)));
}
