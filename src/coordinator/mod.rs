// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine coordinator.
//!
//! The [`OrmEngine`] is the validated, immutable result of a
//! [`Registry`](crate::Registry): entity metadata plus the storage pools,
//! remote caches, local caches and event bus they resolve to. Units of work
//! run through a [`Context`] obtained from [`OrmEngine::context`].
//!
//! # Read path
//!
//! ```text
//! Context::get_by_id
//!   ├─ L1 EntityLocalCache   hit / absent / miss
//!   ├─ L2 RemoteCache        HGET {cache_key} id
//!   └─ L3 StoragePool        SELECT ... WHERE ID IN (...)
//!          └─ fills L2 + L1 (snapshot, or negative marker when missing)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tiered_orm::{EntitySchema, FieldDescriptor, Registry};
//! use tiered_orm::cache::InMemoryRemoteCache;
//! use tiered_orm::storage::InMemoryPool;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), tiered_orm::OrmError> {
//! let mut registry = Registry::new();
//! registry.register_storage_pool(Arc::new(InMemoryPool::new("default")));
//! registry.register_remote_cache(Arc::new(InMemoryRemoteCache::new("default")));
//! registry.register_entity(
//!     EntitySchema::new("User")
//!         .field(FieldDescriptor::text("Name"))
//!         .remote_cache("default")
//!         .local_cache(1000),
//! );
//! let engine = registry.validate()?;
//!
//! let mut ctx = engine.context();
//! let id = ctx.new_record("User").await?.id();
//! ctx.get_mut("User", id).unwrap().set("Name", "John")?;
//! ctx.flush().await?;
//!
//! let user = ctx.get_by_id("User", id).await?.unwrap();
//! assert_eq!(user.get("Name")?.as_str(), Some("John"));
//! # Ok(())
//! # }
//! ```

mod context;
mod read_path;
mod types;

pub use context::Context;
pub use types::{LookupOutcome, Tier};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::cache::{CacheUsage, EntityLocalCache, LruSegment, RemoteCache, ID_COUNTER_KEY};
use crate::config::LazyFlushConfig;
use crate::error::OrmError;
use crate::lazy::{EventBus, LazyFlushConsumer, LazyFlushStatistics};
use crate::schema::{EntityMetadata, DEFAULT_POOL};
use crate::storage::StoragePool;

/// Generic key/value local cache registered by code.
pub type LocalCache = LruSegment<String, serde_json::Value>;

/// Validated engine shared by every context.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`; everything it holds is either immutable
/// after validation or a concurrent structure.
pub struct OrmEngine {
    entities: HashMap<String, Arc<EntityMetadata>>,
    pools: HashMap<String, Arc<dyn StoragePool>>,
    remote_caches: HashMap<String, Arc<dyn RemoteCache>>,
    entity_caches: HashMap<String, Arc<EntityLocalCache>>,
    local_caches: HashMap<String, Arc<LocalCache>>,
    event_bus: Option<Arc<dyn EventBus>>,
    time_offset: i64,
    lazy: LazyFlushConfig,
    /// Entities whose remote id counter this process has seeded.
    seeded_counters: DashMap<String, ()>,
    /// Id counters for entities without a remote cache.
    local_counters: DashMap<String, AtomicU64>,
}

pub(crate) struct EngineParts {
    pub entities: HashMap<String, Arc<EntityMetadata>>,
    pub pools: HashMap<String, Arc<dyn StoragePool>>,
    pub remote_caches: HashMap<String, Arc<dyn RemoteCache>>,
    pub local_caches: HashMap<String, usize>,
    pub event_bus: Option<Arc<dyn EventBus>>,
    pub time_offset: i64,
    pub lazy: LazyFlushConfig,
}

impl OrmEngine {
    pub(crate) fn new(parts: EngineParts) -> Self {
        let entity_caches = parts
            .entities
            .values()
            .filter_map(|meta| {
                meta.local_cache
                    .map(|limit| (meta.name.clone(), Arc::new(EntityLocalCache::new(meta.clone(), limit))))
            })
            .collect();
        let local_caches = parts
            .local_caches
            .into_iter()
            .map(|(code, limit)| {
                let cache = Arc::new(LruSegment::new(code.clone(), limit));
                (code, cache)
            })
            .collect();
        info!(
            entities = parts.entities.len(),
            pools = parts.pools.len(),
            remote_caches = parts.remote_caches.len(),
            lazy = parts.event_bus.is_some(),
            "ORM engine ready"
        );
        Self {
            entities: parts.entities,
            pools: parts.pools,
            remote_caches: parts.remote_caches,
            entity_caches,
            local_caches,
            event_bus: parts.event_bus,
            time_offset: parts.time_offset,
            lazy: parts.lazy,
            seeded_counters: DashMap::new(),
            local_counters: DashMap::new(),
        }
    }

    /// Start a unit of work.
    pub fn context(self: &Arc<Self>) -> Context {
        Context::new(self.clone())
    }

    pub fn metadata(&self, entity: &str) -> Result<Arc<EntityMetadata>, OrmError> {
        self.entities
            .get(entity)
            .cloned()
            .ok_or_else(|| OrmError::Registration(format!("entity {} is not registered", entity)))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityMetadata>> {
        self.entities.values()
    }

    pub fn pool(&self, code: &str) -> Result<Arc<dyn StoragePool>, OrmError> {
        self.pools
            .get(code)
            .cloned()
            .ok_or_else(|| OrmError::Registration(format!("storage pool {} is not registered", code)))
    }

    pub fn remote_cache(&self, code: &str) -> Result<Arc<dyn RemoteCache>, OrmError> {
        self.remote_caches
            .get(code)
            .cloned()
            .ok_or_else(|| OrmError::Registration(format!("remote cache {} is not registered", code)))
    }

    /// Named generic local cache.
    pub fn local_cache(&self, code: &str) -> Result<Arc<LocalCache>, OrmError> {
        self.local_caches
            .get(code)
            .cloned()
            .ok_or_else(|| OrmError::Registration(format!("local cache {} is not registered", code)))
    }

    pub fn time_offset(&self) -> i64 {
        self.time_offset
    }

    pub(crate) fn remote_cache_for(&self, meta: &EntityMetadata) -> Option<Arc<dyn RemoteCache>> {
        meta.remote_cache.as_ref().and_then(|code| self.remote_caches.get(code).cloned())
    }

    pub(crate) fn default_remote_cache(&self) -> Option<Arc<dyn RemoteCache>> {
        self.remote_caches.get(DEFAULT_POOL).cloned()
    }

    /// Cache holding unique reservations and id counters for `meta`.
    pub(crate) fn reservation_cache(&self, meta: &EntityMetadata) -> Option<Arc<dyn RemoteCache>> {
        self.remote_cache_for(meta).or_else(|| self.default_remote_cache())
    }

    pub(crate) fn local_cache_for(&self, meta: &EntityMetadata) -> Option<Arc<EntityLocalCache>> {
        self.entity_caches.get(&meta.name).cloned()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Local cache administration
    // ═══════════════════════════════════════════════════════════════════════

    /// Usage of every local cache: entity segments first, then generic caches.
    pub fn cache_usage(&self) -> Vec<CacheUsage> {
        let mut names: Vec<&String> = self.entity_caches.keys().collect();
        names.sort();
        let mut usage: Vec<CacheUsage> = names
            .into_iter()
            .filter_map(|name| self.entity_caches.get(name))
            .flat_map(|cache| cache.usage())
            .collect();
        let mut generic: Vec<CacheUsage> = self.local_caches.values().map(|c| c.usage()).collect();
        generic.sort_by(|a, b| a.cache.cmp(&b.cache));
        usage.extend(generic);
        usage
    }

    pub fn clear_local_caches(&self) {
        for cache in self.entity_caches.values() {
            cache.clear();
        }
        for cache in self.local_caches.values() {
            cache.clear();
        }
        debug!("Local caches cleared");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lazy flush
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn event_bus(&self) -> Result<Arc<dyn EventBus>, OrmError> {
        self.event_bus
            .clone()
            .ok_or_else(|| OrmError::Registration("no event bus registered for lazy flush".into()))
    }

    pub fn lazy_config(&self) -> &LazyFlushConfig {
        &self.lazy
    }

    pub fn lazy_consumer(self: &Arc<Self>) -> Result<LazyFlushConsumer, OrmError> {
        Ok(LazyFlushConsumer::new(self.clone(), self.event_bus()?, self.lazy.clone()))
    }

    pub fn lazy_statistics(&self) -> Result<LazyFlushStatistics, OrmError> {
        Ok(LazyFlushStatistics::new(
            self.event_bus()?,
            self.default_remote_cache(),
            self.lazy.stream.clone(),
        ))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Id allocation
    // ═══════════════════════════════════════════════════════════════════════

    /// Next id for `meta`: a remote `HINCRBY` counter when a remote cache is
    /// available, otherwise an in-process counter. Both start at `MAX(ID)`.
    pub(crate) async fn next_id(&self, meta: &EntityMetadata) -> Result<u64, OrmError> {
        match self.reservation_cache(meta) {
            Some(cache) => {
                if !self.seeded_counters.contains_key(&meta.name) {
                    let max = self.pool(&meta.storage_pool)?.max_id(&meta.table).await?;
                    cache.hset_nx(ID_COUNTER_KEY, &meta.name, max.to_string().as_bytes()).await?;
                    self.seeded_counters.insert(meta.name.clone(), ());
                }
                let next = cache.hincr_by(ID_COUNTER_KEY, &meta.name, 1).await?;
                u64::try_from(next)
                    .map_err(|_| OrmError::Validation(format!("id counter of {} is negative", meta.name)))
            }
            None => {
                if !self.local_counters.contains_key(&meta.name) {
                    let max = self.pool(&meta.storage_pool)?.max_id(&meta.table).await?;
                    self.local_counters
                        .entry(meta.name.clone())
                        .or_insert_with(|| AtomicU64::new(max));
                }
                let counter = self
                    .local_counters
                    .get(&meta.name)
                    .ok_or_else(|| OrmError::Registration(format!("no id counter for {}", meta.name)))?;
                Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
            }
        }
    }
}
