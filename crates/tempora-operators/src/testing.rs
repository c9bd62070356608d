//! Recording observer used by the unit tests in this crate.

use std::sync::{Arc, Mutex};

use tempora_core::error::Error;
use tempora_core::time::{EventKind, Timestamp};
use tempora_core::types::{Payload, StreamKey};
use tempora_mem::Batch;

use crate::traits::Observer;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Seen<K, P> {
    Row {
        sync: Timestamp,
        other: Timestamp,
        key: K,
        payload: P,
    },
    Punctuation(Timestamp),
    LowWatermark(Timestamp),
    Flush,
    Completed,
    Error(Error),
}

pub(crate) type Log<K, P> = Arc<Mutex<Vec<Seen<K, P>>>>;

pub(crate) struct Collector<K, P> {
    log: Log<K, P>,
}

pub(crate) fn collector<K: StreamKey, P: Payload>() -> (Box<dyn Observer<K, P>>, Log<K, P>) {
    let log: Log<K, P> = Arc::new(Mutex::new(Vec::new()));
    (
        Box::new(Collector {
            log: Arc::clone(&log),
        }),
        log,
    )
}

impl<K: StreamKey, P: Payload> Observer<K, P> for Collector<K, P> {
    fn on_next(&mut self, batch: Batch<K, P>) {
        let mut log = self.log.lock().unwrap();
        for row in batch.live_rows() {
            log.push(match row.kind {
                Some(EventKind::Punctuation) => Seen::Punctuation(row.sync),
                Some(EventKind::LowWatermark) => Seen::LowWatermark(row.sync),
                _ => Seen::Row {
                    sync: row.sync,
                    other: row.other,
                    key: row.key.clone(),
                    payload: row.payload.clone(),
                },
            });
        }
    }

    fn on_flush(&mut self) {
        self.log.lock().unwrap().push(Seen::Flush);
    }

    fn on_completed(&mut self) {
        self.log.lock().unwrap().push(Seen::Completed);
    }

    fn on_error(&mut self, error: Error) {
        self.log.lock().unwrap().push(Seen::Error(error));
    }
}

/// Data rows only, as `(sync, other, payload)`.
pub(crate) fn data_rows<K: Clone, P: Clone>(log: &Log<K, P>) -> Vec<(Timestamp, Timestamp, P)> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|s| match s {
            Seen::Row {
                sync,
                other,
                payload,
                ..
            } => Some((*sync, *other, payload.clone())),
            _ => None,
        })
        .collect()
}

pub(crate) fn punctuations<K, P>(log: &Log<K, P>) -> Vec<Timestamp> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|s| match s {
            Seen::Punctuation(t) => Some(*t),
            _ => None,
        })
        .collect()
}
