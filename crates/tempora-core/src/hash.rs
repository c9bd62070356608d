//! Key hashing for the per-row `hash` column.
//!
//! Hashes are computed once when a row enters a batch and reused by every
//! downstream grouping or partitioning stage. They only need to be stable
//! within a process, so the fast Fx hasher is used rather than a
//! cryptographic one.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

/// Hash a key into the 32-bit value stored in a batch's hash column.
#[inline]
pub fn key_hash<K: Hash + ?Sized>(key: &K) -> i32 {
    let mut h = FxHasher::default();
    key.hash(&mut h);
    let v = h.finish();
    (v ^ (v >> 32)) as i32
}

/// Map a key hash onto one of `buckets` partitions.
#[inline]
pub fn bucket_of(hash: i32, buckets: usize) -> usize {
    debug_assert!(buckets > 0);
    (hash as u32 as usize) % buckets
}
