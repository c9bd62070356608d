//! Engine configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::policy::{DisorderPolicy, FlushPolicy, PeriodicPunctuationPolicy};

/// Default number of rows per batch.
pub const DEFAULT_BATCH_SIZE: usize = 80_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rows per batch (`DataBatchSize`). Every column is rented at this capacity.
    pub batch_size: usize,

    /// Scheduler worker threads. `0` runs every callback inline on the caller.
    pub worker_threads: usize,

    /// Free columns retained per pool; returns beyond this are dropped.
    pub pool_retain_limit: usize,

    /// Response to out-of-order input at ingress.
    pub disorder_policy: DisorderPolicy,

    /// Punctuations injected by ingress.
    pub punctuation_policy: PeriodicPunctuationPolicy,

    /// When ingress pushes partial batches downstream.
    pub flush_policy: FlushPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            worker_threads: 0,
            pool_retain_limit: 1024,
            disorder_policy: DisorderPolicy::default(),
            punctuation_policy: PeriodicPunctuationPolicy::default(),
            flush_policy: FlushPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `TEMPORA_BATCH_SIZE`: rows per batch
    /// - `TEMPORA_WORKER_THREADS`: scheduler threads (0 = inline)
    /// - `TEMPORA_POOL_RETAIN_LIMIT`: free columns kept per pool
    /// - `TEMPORA_PUNCTUATION_PERIOD`: periodic punctuation period (ticks)
    /// - `TEMPORA_DISORDER_POLICY`: `throw`, `drop` or `adjust`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("TEMPORA_BATCH_SIZE") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.batch_size = v;
            }
        }

        if let Ok(s) = std::env::var("TEMPORA_WORKER_THREADS") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.worker_threads = v;
            }
        }

        if let Ok(s) = std::env::var("TEMPORA_POOL_RETAIN_LIMIT") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.pool_retain_limit = v;
            }
        }

        if let Ok(s) = std::env::var("TEMPORA_PUNCTUATION_PERIOD") {
            if let Ok(period) = s.parse::<i64>() {
                cfg.punctuation_policy = PeriodicPunctuationPolicy::Time { period };
            }
        }

        if let Ok(s) = std::env::var("TEMPORA_DISORDER_POLICY") {
            if let Ok(p) = s.parse::<DisorderPolicy>() {
                cfg.disorder_policy = p;
            }
        }

        cfg
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if let Some(period) = self.punctuation_policy.period() {
            if period <= 0 {
                return Err(Error::Config(format!(
                    "punctuation period must be positive, got {period}"
                )));
            }
        }
        Ok(())
    }

    /// Builder-style override used heavily by tests.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }
}
