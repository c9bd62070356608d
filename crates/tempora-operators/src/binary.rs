//! Adapters that present one side of a two-input operator as a plain
//! [`Observer`], for pipelines wired without a scheduler.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use tempora_core::error::Error;
use tempora_core::types::{Payload, StreamKey};
use tempora_mem::Batch;

use crate::traits::{BinaryObserver, Observer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// One input of a shared binary operator.
///
/// Both sides lock the same operator, so its callbacks never overlap.
pub struct BinaryInput<O> {
    target: Arc<Mutex<O>>,
    side: Side,
}

impl<O> BinaryInput<O> {
    pub fn new(target: Arc<Mutex<O>>, side: Side) -> Self {
        Self { target, side }
    }

    /// Left and right adapters over a freshly shared operator.
    pub fn pair(op: O) -> (Arc<Mutex<O>>, Self, Self) {
        let target = Arc::new(Mutex::new(op));
        let left = Self::new(Arc::clone(&target), Side::Left);
        let right = Self::new(Arc::clone(&target), Side::Right);
        (target, left, right)
    }

    pub fn side(&self) -> Side {
        self.side
    }
}

impl<K, P, O> Observer<K, P> for BinaryInput<O>
where
    K: StreamKey,
    P: Payload,
    O: BinaryObserver<K, P>,
{
    fn on_next(&mut self, batch: Batch<K, P>) {
        let mut op = self.target.lock().unwrap_or_else(PoisonError::into_inner);
        match self.side {
            Side::Left => op.on_next_left(batch),
            Side::Right => op.on_next_right(batch),
        }
    }

    fn on_flush(&mut self) {
        self.target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_flush();
    }

    fn on_completed(&mut self) {
        let mut op = self.target.lock().unwrap_or_else(PoisonError::into_inner);
        match self.side {
            Side::Left => op.on_completed_left(),
            Side::Right => op.on_completed_right(),
        }
    }

    fn on_error(&mut self, error: Error) {
        self.target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_error(error);
    }
}
