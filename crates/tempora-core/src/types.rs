//! Key and payload type contracts.
//!
//! Operators are generic over a grouping key `K` and a payload `P`. The bounds
//! below are what batches, pools and operators need; concrete types are picked
//! at pipeline-construction time.

use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// Anything that can sit in a payload column.
pub trait Payload: Clone + Default + Send + Sync + 'static {}

impl<T: Clone + Default + Send + Sync + 'static> Payload for T {}

/// Which specialization of keyed processing a key type selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyKind {
    /// Plain grouping key (or `Empty` for ungrouped streams).
    Simple,
    /// Partition key: punctuations are per partition, low watermarks global.
    Partitioned,
    /// Nested grouping key (outer, inner).
    Compound,
}

/// Grouping key stored in a batch's key column.
pub trait StreamKey: Clone + Default + Eq + Hash + Send + Sync + 'static {
    const KIND: KeyKind = KeyKind::Simple;
    /// True when the outermost key level is a partition key.
    const PARTITIONED: bool = false;
}

/// Key of an ungrouped stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Empty;

impl StreamKey for Empty {}

/// Partition key wrapper; marks a stream as partitioned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey<T>(pub T);

impl<T: Clone + Default + Eq + Hash + Send + Sync + 'static> StreamKey for PartitionKey<T> {
    const KIND: KeyKind = KeyKind::Partitioned;
    const PARTITIONED: bool = true;
}

/// Grouping nested inside an outer key (possibly a partition key).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompoundKey<O, I> {
    pub outer: O,
    pub inner: I,
}

impl<O: StreamKey, I: StreamKey> StreamKey for CompoundKey<O, I> {
    const KIND: KeyKind = KeyKind::Compound;
    const PARTITIONED: bool = O::PARTITIONED;
}

macro_rules! simple_keys {
    ($($t:ty),* $(,)?) => {
        $(impl StreamKey for $t {})*
    };
}

simple_keys!(bool, u8, u16, u32, u64, i8, i16, i32, i64, usize, char, String);
