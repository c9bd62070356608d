//! Explicit pool lookup.
//!
//! Column pools are keyed by `(element type, ColumnKind)` and memory pools by
//! `(K, P)`. Operators resolve their pool once at construction through a
//! registry handed to them; there is no process-wide pool table.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tempora_core::config::EngineConfig;
use tempora_core::types::{Payload, StreamKey};

use crate::column::Element;
use crate::memory_pool::MemoryPool;
use crate::pool::{ColumnKind, ColumnPool};

type AnyPool = Box<dyn Any + Send + Sync>;

struct Tables {
    columns: HashMap<(TypeId, ColumnKind), AnyPool>,
    batches: HashMap<(TypeId, TypeId), AnyPool>,
}

/// Cheap to clone; clones see the same pools.
#[derive(Clone)]
pub struct PoolRegistry {
    batch_size: usize,
    retain: usize,
    tables: Arc<Mutex<Tables>>,
}

impl PoolRegistry {
    pub fn new(batch_size: usize, retain: usize) -> Self {
        Self {
            batch_size,
            retain,
            tables: Arc::new(Mutex::new(Tables {
                columns: HashMap::new(),
                batches: HashMap::new(),
            })),
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(cfg.batch_size, cfg.pool_retain_limit)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// The column pool for element type `T` and `kind`, created on first use.
    pub fn column_pool<T: Element>(&self, kind: ColumnKind) -> ColumnPool<T> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        self.column_pool_locked(&mut tables, kind)
    }

    fn column_pool_locked<T: Element>(&self, tables: &mut Tables, kind: ColumnKind) -> ColumnPool<T> {
        let entry = tables
            .columns
            .entry((TypeId::of::<T>(), kind))
            .or_insert_with(|| {
                Box::new(ColumnPool::<T>::new(
                    kind.capacity_for(self.batch_size),
                    self.retain,
                    kind,
                ))
            });
        match entry.downcast_ref::<ColumnPool<T>>() {
            Some(pool) => pool.clone(),
            None => unreachable!("column pool table keyed by TypeId holds a foreign type"),
        }
    }

    /// The memory pool for `(K, P)`, created on first use.
    pub fn memory_pool<K: StreamKey, P: Payload>(&self) -> MemoryPool<K, P> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let id = (TypeId::of::<K>(), TypeId::of::<P>());
        if let Some(existing) = tables.batches.get(&id) {
            match existing.downcast_ref::<MemoryPool<K, P>>() {
                Some(pool) => return pool.clone(),
                None => unreachable!("memory pool table keyed by TypeId holds a foreign type"),
            }
        }
        let pool = MemoryPool::from_pools(
            self.batch_size,
            self.column_pool_locked::<i64>(&mut tables, ColumnKind::Data),
            self.column_pool_locked::<K>(&mut tables, ColumnKind::Data),
            self.column_pool_locked::<P>(&mut tables, ColumnKind::Data),
            self.column_pool_locked::<i32>(&mut tables, ColumnKind::Data),
            self.column_pool_locked::<u64>(&mut tables, ColumnKind::BitVector),
        );
        tables.batches.insert(id, Box::new(pool.clone()));
        pool
    }

    /// Number of distinct column pools created so far.
    pub fn column_pool_count(&self) -> usize {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .columns
            .len()
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("batch_size", &self.batch_size)
            .field("retain", &self.retain)
            .field("column_pools", &self.column_pool_count())
            .finish()
    }
}
