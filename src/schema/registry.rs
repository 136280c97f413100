// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::entity::{EntityMetadata, EntitySchema, DEFAULT_POOL};
use super::field::{EnumDefinition, FieldKind, FieldLayout};
use crate::cache::{RedisCache, RemoteCache};
use crate::config::{EngineConfig, LazyFlushConfig};
use crate::coordinator::{EngineParts, OrmEngine};
use crate::error::OrmError;
use crate::lazy::{EventBus, RedisStreamBus};
use crate::storage::{SqlPool, StoragePool};

/// Mutable collection of entity declarations and backends.
///
/// [`Registry::validate`] checks everything against everything else and
/// freezes the result into an [`OrmEngine`].
#[derive(Default)]
pub struct Registry {
    entities: Vec<EntitySchema>,
    enums: HashMap<String, Arc<EnumDefinition>>,
    pools: HashMap<String, Arc<dyn StoragePool>>,
    remote_caches: HashMap<String, Arc<dyn RemoteCache>>,
    local_caches: HashMap<String, usize>,
    event_bus: Option<Arc<dyn EventBus>>,
    time_offset: i64,
    lazy: LazyFlushConfig,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the default backends named in `config` connected and
    /// registered under the code `"default"`. Connections use the startup
    /// retry policy and fail fast afterwards.
    pub async fn from_config(config: &EngineConfig) -> Result<Self, OrmError> {
        let mut registry = Self::new();
        registry.set_time_offset(config.time_offset_secs);
        registry.set_lazy_flush_config(config.lazy_flush.clone());

        if let Some(url) = &config.sql_url {
            let pool = SqlPool::new(DEFAULT_POOL, url, config.sql_max_connections).await?;
            registry.register_storage_pool(Arc::new(pool));
        }
        if let Some(url) = &config.redis_url {
            let prefix = config.redis_prefix.as_deref();
            let cache = RedisCache::new(DEFAULT_POOL, url, prefix).await?;
            registry.register_event_bus(Arc::new(RedisStreamBus::from_connection(cache.connection(), prefix)));
            registry.register_remote_cache(Arc::new(cache));
        }
        info!(
            sql = config.sql_url.is_some(),
            redis = config.redis_url.is_some(),
            "Default backends connected"
        );
        Ok(registry)
    }

    /// Register a storage pool under its own code, replacing any earlier one.
    pub fn register_storage_pool(&mut self, pool: Arc<dyn StoragePool>) {
        self.pools.insert(pool.code().to_string(), pool);
    }

    pub fn register_remote_cache(&mut self, cache: Arc<dyn RemoteCache>) {
        self.remote_caches.insert(cache.code().to_string(), cache);
    }

    /// Generic key/value local cache; `limit == 0` never evicts.
    pub fn register_local_cache(&mut self, code: impl Into<String>, limit: usize) {
        self.local_caches.insert(code.into(), limit);
    }

    pub fn register_enum(&mut self, code: &str, values: &[&str]) -> Result<(), OrmError> {
        if self.enums.contains_key(code) {
            return Err(OrmError::Registration(format!("enum {} is already registered", code)));
        }
        let definition = EnumDefinition::new(code, values)?;
        self.enums.insert(code.to_string(), Arc::new(definition));
        Ok(())
    }

    pub fn register_entity(&mut self, schema: EntitySchema) {
        self.entities.push(schema);
    }

    /// Queue used by lazy flush.
    pub fn register_event_bus(&mut self, bus: Arc<dyn EventBus>) {
        self.event_bus = Some(bus);
    }

    pub fn set_time_offset(&mut self, seconds: i64) {
        self.time_offset = seconds;
    }

    pub fn set_lazy_flush_config(&mut self, config: LazyFlushConfig) {
        self.lazy = config;
    }

    /// Build metadata for every entity and freeze the registry.
    pub fn validate(self) -> Result<Arc<OrmEngine>, OrmError> {
        let mut entities: HashMap<String, Arc<EntityMetadata>> = HashMap::with_capacity(self.entities.len());
        for schema in &self.entities {
            if entities.contains_key(&schema.name) {
                return Err(OrmError::Registration(format!("entity {} is registered twice", schema.name)));
            }
            if !self.pools.contains_key(&schema.storage_pool) {
                return Err(OrmError::Registration(format!(
                    "entity {} uses unknown storage pool {}",
                    schema.name, schema.storage_pool
                )));
            }
            if let Some(code) = &schema.remote_cache {
                if !self.remote_caches.contains_key(code) {
                    return Err(OrmError::Registration(format!(
                        "entity {} uses unknown remote cache {}",
                        schema.name, code
                    )));
                }
            }
            let meta = EntityMetadata::build(schema, &self.enums)?;
            entities.insert(schema.name.clone(), Arc::new(meta));
        }

        for meta in entities.values() {
            check_targets(&meta.name, &meta.layout, &entities)?;
        }

        Ok(Arc::new(OrmEngine::new(EngineParts {
            entities,
            pools: self.pools,
            remote_caches: self.remote_caches,
            local_caches: self.local_caches,
            event_bus: self.event_bus,
            time_offset: self.time_offset,
            lazy: self.lazy,
        })))
    }
}

/// Every reference field, nested ones included, must point at a
/// registered entity.
fn check_targets(
    entity: &str,
    layout: &FieldLayout,
    entities: &HashMap<String, Arc<EntityMetadata>>,
) -> Result<(), OrmError> {
    for field in layout.fields() {
        match &field.kind {
            FieldKind::Reference { target } | FieldKind::References { target } => {
                if !entities.contains_key(target) {
                    return Err(OrmError::Registration(format!(
                        "{}.{} references unregistered entity {}",
                        entity, field.column, target
                    )));
                }
            }
            FieldKind::Struct(nested) => check_targets(entity, nested, entities)?,
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryRemoteCache;
    use crate::schema::FieldDescriptor;
    use crate::storage::InMemoryPool;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_storage_pool(Arc::new(InMemoryPool::new("default")));
        registry.register_remote_cache(Arc::new(InMemoryRemoteCache::new("default")));
        registry
    }

    #[test]
    fn test_validate_builds_engine() {
        let mut registry = registry();
        registry.register_enum("color", &["red", "blue"]).unwrap();
        registry.register_local_cache("sessions", 10);
        registry.register_entity(
            EntitySchema::new("Car")
                .field(FieldDescriptor::enumeration("Color", "color").required())
                .remote_cache("default"),
        );
        let engine = registry.validate().unwrap();
        assert_eq!(engine.metadata("Car").unwrap().table, "Car");
        assert!(engine.local_cache("sessions").is_ok());
        assert!(matches!(engine.metadata("Boat"), Err(OrmError::Registration(_))));
    }

    #[test]
    fn test_unknown_pool_or_cache_rejected() {
        let mut registry = registry();
        registry.register_entity(EntitySchema::new("A").storage_pool("archive"));
        assert!(matches!(registry.validate(), Err(OrmError::Registration(_))));

        let mut registry = self::registry();
        registry.register_entity(EntitySchema::new("A").remote_cache("sessions"));
        assert!(matches!(registry.validate(), Err(OrmError::Registration(_))));
    }

    #[test]
    fn test_duplicate_entity_and_enum_rejected() {
        let mut registry = registry();
        assert!(registry.register_enum("e", &["a"]).is_ok());
        assert!(registry.register_enum("e", &["b"]).is_err());
        registry.register_entity(EntitySchema::new("A"));
        registry.register_entity(EntitySchema::new("A"));
        assert!(matches!(registry.validate(), Err(OrmError::Registration(_))));
    }

    #[test]
    fn test_nested_reference_target_checked() {
        let mut registry = registry();
        registry.register_entity(EntitySchema::new("Order").field(FieldDescriptor::structure(
            "Shipping",
            vec![FieldDescriptor::reference("Country", "Country")],
        )));
        let err = registry.validate().err().unwrap();
        assert!(err.to_string().contains("ShippingCountry"));
    }
}
