//! Ingress-side policies: disorder handling, punctuation generation, flushing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::time::{quantize, Timestamp};

/// What to do with a row whose sync time is below the current watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisorderPolicy {
    /// Surface `Error::OutOfOrder` on the error channel.
    #[default]
    Throw,
    /// Discard the offending row.
    Drop,
    /// Clamp the row's sync time up to the watermark.
    Adjust,
}

impl FromStr for DisorderPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "throw" => Ok(DisorderPolicy::Throw),
            "drop" => Ok(DisorderPolicy::Drop),
            "adjust" => Ok(DisorderPolicy::Adjust),
            other => Err(Error::Config(format!("unknown disorder policy '{other}'"))),
        }
    }
}

impl fmt::Display for DisorderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisorderPolicy::Throw => "throw",
            DisorderPolicy::Drop => "drop",
            DisorderPolicy::Adjust => "adjust",
        };
        f.write_str(s)
    }
}

/// When the ingress boundary injects punctuations on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodicPunctuationPolicy {
    /// Only punctuations supplied by the producer are emitted.
    #[default]
    None,
    /// Emit a punctuation each time event time crosses a multiple of `period`.
    Time { period: Timestamp },
}

impl PeriodicPunctuationPolicy {
    pub fn period(&self) -> Option<Timestamp> {
        match self {
            PeriodicPunctuationPolicy::None => None,
            PeriodicPunctuationPolicy::Time { period } => Some(*period),
        }
    }

    /// Punctuation to emit when event time moves from `last` to `now`, if any.
    pub fn due(&self, last: Timestamp, now: Timestamp) -> Option<Timestamp> {
        let period = self.period()?;
        let boundary = quantize(now, period);
        (boundary > last).then_some(boundary)
    }
}

/// When batches buffered at the ingress boundary are pushed downstream eagerly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Only full batches are pushed; flushing is left to the caller.
    None,
    /// Push the partial batch and flush downstream on every punctuation.
    #[default]
    FlushOnPunctuation,
    /// Push and flush on every low watermark (partitioned streams).
    FlushOnLowWatermark,
    /// Flush downstream after every pushed batch.
    FlushOnBatchBoundary,
}
