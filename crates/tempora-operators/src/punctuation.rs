//! Punctuation and watermark protocol helpers.
//!
//! - [`DisorderGuard`] applies a `DisorderPolicy` to rows arriving below the
//!   current watermark.
//! - [`PunctuationMerger`] combines the punctuation streams of two inputs:
//!   the output advances to `min(left, right)` and only when that advances.
//! - [`PeriodicPunctuation`] injects punctuations on period boundaries.

use serde::{Deserialize, Serialize};

use tempora_core::error::{Error, Result};
use tempora_core::policy::{DisorderPolicy, PeriodicPunctuationPolicy};
use tempora_core::time::{Timestamp, INFINITY, MIN_SYNC_TIME};

use crate::binary::Side;

/// Outcome of admitting a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Accept with the sync time clamped to the given value.
    Adjust(Timestamp),
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisorderGuard {
    policy: DisorderPolicy,
    watermark: Timestamp,
    #[serde(default)]
    dropped: u64,
    #[serde(default)]
    adjusted: u64,
}

impl DisorderGuard {
    pub fn new(policy: DisorderPolicy) -> Self {
        Self {
            policy,
            watermark: MIN_SYNC_TIME,
            dropped: 0,
            adjusted: 0,
        }
    }

    pub fn policy(&self) -> DisorderPolicy {
        self.policy
    }

    /// Lowest sync time still admitted without intervention.
    pub fn watermark(&self) -> Timestamp {
        self.watermark
    }

    /// Raise the watermark to `t` (never lowers it).
    pub fn advance(&mut self, t: Timestamp) {
        self.watermark = self.watermark.max(t);
    }

    /// Decide what to do with a data row `(sync, other)`.
    ///
    /// An adjusted interval that would become empty is dropped instead. The
    /// watermark is not moved; callers advance it as their contract requires.
    pub fn admit(&mut self, sync: Timestamp, other: Timestamp) -> Result<Admission> {
        if sync >= self.watermark {
            return Ok(Admission::Accept);
        }
        match self.policy {
            DisorderPolicy::Throw => Err(Error::OutOfOrder {
                sync,
                watermark: self.watermark,
            }),
            DisorderPolicy::Drop => {
                self.dropped += 1;
                #[cfg(feature = "tracing")]
                tracing::trace!(sync, watermark = self.watermark, "dropped out-of-order row");
                Ok(Admission::Drop)
            }
            DisorderPolicy::Adjust => {
                let is_interval = other != INFINITY && other >= sync;
                if is_interval && other <= self.watermark {
                    self.dropped += 1;
                    return Ok(Admission::Drop);
                }
                self.adjusted += 1;
                #[cfg(feature = "tracing")]
                tracing::trace!(sync, watermark = self.watermark, "clamped out-of-order row");
                Ok(Admission::Adjust(self.watermark))
            }
        }
    }

    /// Decide what to do with a control row at `time`. Returns the time to
    /// emit at, or `None` when the policy discards it.
    pub fn admit_control(&mut self, time: Timestamp) -> Result<Option<Timestamp>> {
        if time >= self.watermark {
            return Ok(Some(time));
        }
        match self.policy {
            DisorderPolicy::Throw => Err(Error::OutOfOrder {
                sync: time,
                watermark: self.watermark,
            }),
            DisorderPolicy::Drop => {
                self.dropped += 1;
                Ok(None)
            }
            DisorderPolicy::Adjust => {
                self.adjusted += 1;
                Ok(Some(self.watermark))
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn adjusted(&self) -> u64 {
        self.adjusted
    }
}

/// Merges the punctuations of a two-input operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunctuationMerger {
    left: Timestamp,
    right: Timestamp,
    emitted: Timestamp,
}

impl Default for PunctuationMerger {
    fn default() -> Self {
        Self {
            left: MIN_SYNC_TIME,
            right: MIN_SYNC_TIME,
            emitted: MIN_SYNC_TIME,
        }
    }
}

impl PunctuationMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a punctuation at `time` from `side`. Returns the new global
    /// punctuation if it advanced.
    pub fn update(&mut self, side: Side, time: Timestamp) -> Option<Timestamp> {
        let slot = match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        };
        *slot = (*slot).max(time);
        let merged = self.left.min(self.right);
        if merged > self.emitted {
            self.emitted = merged;
            Some(merged)
        } else {
            None
        }
    }

    /// A completed side no longer holds the other one back.
    pub fn complete(&mut self, side: Side) -> Option<Timestamp> {
        self.update(side, INFINITY)
    }

    pub fn side(&self, side: Side) -> Timestamp {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }

    /// Last global punctuation emitted.
    pub fn current(&self) -> Timestamp {
        self.emitted
    }

    pub fn is_complete(&self) -> bool {
        self.left == INFINITY && self.right == INFINITY
    }
}

/// Injects punctuations each time event time crosses a period boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicPunctuation {
    policy: PeriodicPunctuationPolicy,
    last: Timestamp,
}

impl PeriodicPunctuation {
    pub fn new(policy: PeriodicPunctuationPolicy) -> Self {
        Self {
            policy,
            last: MIN_SYNC_TIME,
        }
    }

    /// Punctuation due now that event time reached `now`, if any.
    pub fn observe(&mut self, now: Timestamp) -> Option<Timestamp> {
        let due = self.policy.due(self.last, now)?;
        self.last = due;
        Some(due)
    }

    /// Note a punctuation emitted by other means so it is not repeated.
    pub fn note(&mut self, time: Timestamp) {
        self.last = self.last.max(time);
    }

    pub fn last(&self) -> Timestamp {
        self.last
    }
}
