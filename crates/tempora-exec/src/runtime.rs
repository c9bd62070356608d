//! Runtime: owns the configuration, the pool registry and the scheduler.
//!
//! Pipelines are built against an `Engine`: operators get their memory pools
//! from `memory_pool`, are registered through `register` /
//! `register_binary`, and the ingress is created with the engine's policies.

use tracing::info;

use tempora_core::config::EngineConfig;
use tempora_core::types::{Payload, StreamKey};
use tempora_mem::{MemoryPool, PoolRegistry};
use tempora_operators::{BinaryObserver, Ingress, Observer, Pipe};

use crate::error::{ExecError, Result};
use crate::metrics::MetricsSnapshot;
use crate::scheduler::Scheduler;
use crate::task::TaskHandle;

pub struct Engine {
    config: EngineConfig,
    pools: PoolRegistry,
    scheduler: Scheduler,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ExecError::Config(e.to_string()))?;
        let scheduler = Scheduler::from_config(&config)?;
        let pools = PoolRegistry::from_config(&config);
        info!(
            batch_size = config.batch_size,
            worker_threads = config.worker_threads,
            "engine started"
        );
        Ok(Self {
            config,
            pools,
            scheduler,
        })
    }

    /// Engine configured from `TEMPORA_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(EngineConfig::from_env())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pools(&self) -> &PoolRegistry {
        &self.pools
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn memory_pool<K: StreamKey, P: Payload>(&self) -> MemoryPool<K, P> {
        self.pools.memory_pool()
    }

    /// Ingress using the engine's disorder, punctuation and flush policies.
    pub fn ingress<K: StreamKey, P: Payload>(
        &self,
        downstream: Box<dyn Observer<K, P>>,
    ) -> Ingress<K, P> {
        Ingress::from_config(self.memory_pool(), &self.config, downstream)
    }

    pub fn register<K, P, O>(&self, op: O) -> TaskHandle<O>
    where
        K: StreamKey,
        P: Payload,
        O: Observer<K, P> + Pipe + 'static,
    {
        self.scheduler.register(op)
    }

    pub fn register_binary<K, P, O>(&self, op: O) -> TaskHandle<O>
    where
        K: StreamKey,
        P: Payload,
        O: BinaryObserver<K, P> + Pipe + 'static,
    {
        self.scheduler.register_binary(op)
    }

    /// Block until every queued unit has run.
    pub fn wait_idle(&self) {
        self.scheduler.wait_idle();
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.scheduler.metrics()
    }

    pub fn shutdown(&self) {
        let m = self.scheduler.metrics();
        info!(
            units_run = m.units_run,
            faults = m.faults,
            retired = m.retired,
            "engine shutting down"
        );
        self.scheduler.stop();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("pools", &self.pools)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
