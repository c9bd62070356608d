//! Checkpoint framing for operator state.
//!
//! Layout:
//! [ magic: u32 ][ version: u16 ][ reserved: u16 ][ payload_len: u64 ]
//! [ payload bytes … ]
//! [ blake3(header || payload): 32 bytes ]
//!
//! The payload is the serde_json encoding of whatever state the operator
//! chooses to persist. Fields an operator can recompute from the persisted
//! ones are left out with `#[serde(skip)]` and rebuilt on restore.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use tempora_core::time::Timestamp;
use tempora_core::types::{Payload, StreamKey};

use crate::batch::Batch;
use crate::error::{Error, Result};
use crate::memory_pool::MemoryPool;

pub const MAGIC: u32 = 0x5450_434B; // "TPCK"
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 4 + 2 + 2 + 8;
pub const CHECKSUM_LEN: usize = 32;

/// Upper bound on a single state payload; guards allocation on corrupt input.
pub const MAX_PAYLOAD_LEN: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub payload_len: u64,
}

impl FrameHeader {
    pub fn new(payload_len: u64) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            payload_len,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        // bytes[6..8] reserved
        out[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[8..16]);
        let payload_len = u64::from_le_bytes(len);

        if magic != MAGIC {
            return Err(Error::BadHeader(format!("bad magic {magic:#010x}")));
        }
        if version != VERSION {
            return Err(Error::BadHeader(format!("unsupported version {version}")));
        }
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::BadHeader(format!(
                "payload_len {payload_len} exceeds max {MAX_PAYLOAD_LEN}"
            )));
        }
        Ok(Self {
            magic,
            version,
            payload_len,
        })
    }
}

fn checksum(header: &[u8], payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    hasher.finalize().into()
}

/// Write one framed state record.
pub fn write_state<T: Serialize + ?Sized>(sink: &mut dyn Write, state: &T) -> Result<()> {
    let payload =
        serde_json::to_vec(state).map_err(|e| Error::Codec(format!("json serialize: {e}")))?;
    let header = FrameHeader::new(payload.len() as u64).to_bytes();
    let sum = checksum(&header, &payload);

    sink.write_all(&header)?;
    sink.write_all(&payload)?;
    sink.write_all(&sum)?;
    Ok(())
}

/// Read one framed state record written by [`write_state`].
pub fn read_state<T: DeserializeOwned>(source: &mut dyn Read) -> Result<T> {
    let mut header_bytes = [0u8; HEADER_LEN];
    source.read_exact(&mut header_bytes)?;
    let header = FrameHeader::from_bytes(&header_bytes)?;

    // the header is not yet verified; grow with the bytes actually present
    let mut payload = Vec::new();
    let read = (&mut *source).take(header.payload_len).read_to_end(&mut payload)? as u64;
    if read != header.payload_len {
        return Err(Error::BadHeader(format!(
            "payload truncated: header claims {} bytes, found {read}",
            header.payload_len
        )));
    }

    let mut expected = [0u8; CHECKSUM_LEN];
    source.read_exact(&mut expected)?;
    if checksum(&header_bytes, &payload) != expected {
        return Err(Error::ChecksumMismatch);
    }

    serde_json::from_slice(&payload).map_err(|e| Error::Codec(format!("json deserialize: {e}")))
}

/// One persisted batch row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowSnapshot<K, P> {
    pub sync: Timestamp,
    pub other: Timestamp,
    pub key: K,
    pub payload: P,
    pub hash: i32,
    pub deleted: bool,
}

/// Serializable copy of an in-flight batch. Control-row bits are implied by
/// `other` and are not stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot<K, P> {
    pub rows: Vec<RowSnapshot<K, P>>,
}

impl<K: StreamKey, P: Payload> Batch<K, P> {
    pub fn snapshot(&self) -> BatchSnapshot<K, P> {
        BatchSnapshot {
            rows: (0..self.len())
                .map(|i| RowSnapshot {
                    sync: self.sync(i),
                    other: self.other(i),
                    key: self.key(i).clone(),
                    payload: self.payload(i).clone(),
                    hash: self.hash(i),
                    deleted: self.is_tombstone(i),
                })
                .collect(),
        }
    }
}

impl<K: StreamKey, P: Payload> MemoryPool<K, P> {
    /// Rebuild a batch from a snapshot. Fails if the snapshot holds more rows
    /// than this pool's batch size.
    pub fn restore(&self, snapshot: BatchSnapshot<K, P>) -> Result<Batch<K, P>> {
        if snapshot.rows.len() > self.batch_size() {
            return Err(Error::Codec(format!(
                "snapshot holds {} rows, batch size is {}",
                snapshot.rows.len(),
                self.batch_size()
            )));
        }
        let mut batch = self.get();
        for (i, row) in snapshot.rows.into_iter().enumerate() {
            batch.add_with_hash(row.sync, row.other, row.key, row.payload, row.hash);
            if row.deleted {
                batch.set_deleted(i);
            }
        }
        Ok(batch)
    }
}
