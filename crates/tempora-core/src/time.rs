//! Event-time encodings.
//!
//! Every row carries two timestamps. `sync` orders the stream; `other`
//! encodes what kind of row it is:
//!
//! | `other`              | meaning                                          |
//! |----------------------|--------------------------------------------------|
//! | `INFINITY`           | start edge (open-ended validity)                 |
//! | `>= sync`            | interval `[sync, other)`                         |
//! | `< sync`             | end edge closing an interval that began at `other` |
//! | `PUNCTUATION_TIME`   | punctuation control row                          |
//! | `LOW_WATERMARK_TIME` | low watermark (partitioned streams only)         |

use serde::{Deserialize, Serialize};

/// Event time, in application-defined ticks.
pub type Timestamp = i64;

/// Smallest representable sync time; also "nothing observed yet".
pub const MIN_SYNC_TIME: Timestamp = i64::MIN;

/// `other` value of a start edge, and the sync time of the final punctuation.
pub const INFINITY: Timestamp = i64::MAX;

/// `other` value marking a punctuation row.
pub const PUNCTUATION_TIME: Timestamp = i64::MIN;

/// `other` value marking a low-watermark row.
pub const LOW_WATERMARK_TIME: Timestamp = i64::MIN + 1;

/// Shape of a row as decoded from its `(sync, other)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    StartEdge,
    Interval,
    EndEdge,
    Punctuation,
    LowWatermark,
}

impl EventKind {
    /// Decode a `(sync, other)` pair.
    pub fn classify(sync: Timestamp, other: Timestamp) -> Self {
        match other {
            PUNCTUATION_TIME => EventKind::Punctuation,
            LOW_WATERMARK_TIME => EventKind::LowWatermark,
            INFINITY => EventKind::StartEdge,
            o if o >= sync => EventKind::Interval,
            _ => EventKind::EndEdge,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, EventKind::Punctuation | EventKind::LowWatermark)
    }

    pub fn is_data(self) -> bool {
        !self.is_control()
    }
}

/// True when `other` is one of the control markers.
#[inline]
pub fn is_control_time(other: Timestamp) -> bool {
    other == PUNCTUATION_TIME || other == LOW_WATERMARK_TIME
}

/// Round `t` down to a multiple of `period` (floor semantics for negatives).
///
/// `period` must be positive.
#[inline]
pub fn quantize(t: Timestamp, period: Timestamp) -> Timestamp {
    debug_assert!(period > 0, "quantize period must be positive");
    t - t.rem_euclid(period)
}
