// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache-aside reads: local tier, then remote tier, then storage.
//!
//! Storage results are written back to both tiers. Missing rows are cached
//! as negative entries so repeated lookups of unknown ids stay off storage.
//! Reference collections are cached remotely as id sets carrying
//! [`VALID_MARKER`] and locally as materialized record lists.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::context::Context;
use super::types::{record_lookup, LookupOutcome, Tier};
use crate::cache::{
    classify, entity_key, reference_key, CacheEntry, RemoteCommand, NEGATIVE_MARKER, VALID_MARKER,
};
use crate::codec::{self, SqlValue};
use crate::error::OrmError;
use crate::record::Record;
use crate::schema::{EntityMetadata, ALL_REFERENCE};
use crate::storage::{Filter, Row, SelectQuery};

fn select(meta: &EntityMetadata, filter: Filter) -> SelectQuery {
    SelectQuery {
        table: meta.table.clone(),
        columns: meta.columns().to_vec(),
        filter,
    }
}

/// Rows come back as `ID` followed by the entity's columns.
fn record_from_row(meta: &Arc<EntityMetadata>, mut row: Row, offset: i64) -> Result<Record, OrmError> {
    if row.is_empty() {
        return Err(OrmError::Validation(format!("empty row loaded for {}", meta.name)));
    }
    let id = row
        .remove(0)
        .as_u64()
        .ok_or_else(|| OrmError::Validation(format!("row of {} has no numeric ID", meta.name)))?;
    let values = codec::values_from_row(&meta.layout, row, offset)?;
    Ok(Record::loaded(meta.clone(), id, values))
}

fn from_cache(meta: &Arc<EntityMetadata>, id: u64, snapshot: Vec<u8>, lazy: bool) -> Result<Record, OrmError> {
    if lazy {
        Ok(Record::lazy(meta.clone(), id, Arc::from(snapshot)))
    } else {
        Record::from_snapshot(meta.clone(), id, &snapshot)
    }
}

impl Context {
    /// Load one record. `None` when no row exists.
    pub async fn get_by_id(&self, entity: &str, id: u64) -> Result<Option<Arc<Record>>, OrmError> {
        self.load_by_id(entity, id, false).await
    }

    /// Like [`Context::get_by_id`], but records served from the remote tier
    /// keep only their snapshot and decode on first access.
    pub async fn get_by_id_lazy(&self, entity: &str, id: u64) -> Result<Option<Arc<Record>>, OrmError> {
        self.load_by_id(entity, id, true).await
    }

    async fn load_by_id(&self, entity: &str, id: u64, lazy: bool) -> Result<Option<Arc<Record>>, OrmError> {
        let meta = self.engine.metadata(entity)?;
        if id == 0 {
            return Ok(None);
        }

        let local = self.engine.local_cache_for(&meta);
        if let Some(local) = &local {
            match local.get(id) {
                CacheEntry::Hit(record) => {
                    record_lookup(Tier::Local, entity, LookupOutcome::Hit);
                    return Ok(Some(record));
                }
                CacheEntry::Absent => {
                    record_lookup(Tier::Local, entity, LookupOutcome::Absent);
                    return Ok(None);
                }
                CacheEntry::Miss => record_lookup(Tier::Local, entity, LookupOutcome::Miss),
            }
        }

        let remote = self.engine.remote_cache_for(&meta);
        let key = entity_key(&meta);
        let field = id.to_string();
        if let Some(remote) = &remote {
            match classify(remote.hget(&key, &field).await?) {
                CacheEntry::Hit(snapshot) => {
                    record_lookup(Tier::Remote, entity, LookupOutcome::Hit);
                    let record = Arc::new(from_cache(&meta, id, snapshot, lazy)?);
                    if let Some(local) = &local {
                        local.set(id, record.clone());
                    }
                    return Ok(Some(record));
                }
                CacheEntry::Absent => {
                    record_lookup(Tier::Remote, entity, LookupOutcome::Absent);
                    if let Some(local) = &local {
                        local.set_absent(id);
                    }
                    return Ok(None);
                }
                CacheEntry::Miss => record_lookup(Tier::Remote, entity, LookupOutcome::Miss),
            }
        }

        let pool = self.engine.pool(&meta.storage_pool)?;
        let rows = pool.query(&select(&meta, Filter::Ids(vec![id]))).await?;
        match rows.into_iter().next() {
            Some(row) => {
                record_lookup(Tier::Storage, entity, LookupOutcome::Hit);
                let record = Arc::new(record_from_row(&meta, row, self.engine.time_offset())?);
                if let Some(remote) = &remote {
                    remote.hset(&key, &field, &record.snapshot()?).await?;
                }
                if let Some(local) = &local {
                    local.set(id, record.clone());
                }
                Ok(Some(record))
            }
            None => {
                record_lookup(Tier::Storage, entity, LookupOutcome::Absent);
                debug!(entity, id, "Caching missing row");
                // a concurrent insert may already have cached the row
                if let Some(remote) = &remote {
                    remote.hset_nx(&key, &field, NEGATIVE_MARKER).await?;
                }
                if let Some(local) = &local {
                    local.set_absent(id);
                }
                Ok(None)
            }
        }
    }

    /// Load many records in one pass per tier. The result follows `ids`,
    /// with `None` for ids that have no row.
    pub async fn get_by_ids(&self, entity: &str, ids: &[u64]) -> Result<Vec<Option<Arc<Record>>>, OrmError> {
        let meta = self.engine.metadata(entity)?;
        let mut found: HashMap<u64, Option<Arc<Record>>> = HashMap::with_capacity(ids.len());
        let mut missing: Vec<u64> = Vec::with_capacity(ids.len());
        for &id in ids {
            if id != 0 && !missing.contains(&id) {
                missing.push(id);
            }
        }

        let local = self.engine.local_cache_for(&meta);
        if let Some(local) = &local {
            missing.retain(|&id| match local.get(id) {
                CacheEntry::Hit(record) => {
                    found.insert(id, Some(record));
                    false
                }
                CacheEntry::Absent => {
                    found.insert(id, None);
                    false
                }
                CacheEntry::Miss => true,
            });
        }

        let remote = self.engine.remote_cache_for(&meta);
        let key = entity_key(&meta);
        if let Some(remote) = remote.as_ref().filter(|_| !missing.is_empty()) {
            let fields: Vec<String> = missing.iter().map(u64::to_string).collect();
            let values = remote.hmget(&key, &fields).await?;
            let mut unresolved = Vec::new();
            for (&id, raw) in missing.iter().zip(values) {
                match classify(raw) {
                    CacheEntry::Hit(snapshot) => {
                        let record = Arc::new(Record::from_snapshot(meta.clone(), id, &snapshot)?);
                        if let Some(local) = &local {
                            local.set(id, record.clone());
                        }
                        found.insert(id, Some(record));
                    }
                    CacheEntry::Absent => {
                        if let Some(local) = &local {
                            local.set_absent(id);
                        }
                        found.insert(id, None);
                    }
                    CacheEntry::Miss => unresolved.push(id),
                }
            }
            missing = unresolved;
        }

        if !missing.is_empty() {
            debug!(entity, ids = missing.len(), "Loading records from storage");
            let pool = self.engine.pool(&meta.storage_pool)?;
            let rows = pool.query(&select(&meta, Filter::Ids(missing.clone()))).await?;
            let mut commands = Vec::with_capacity(missing.len());
            for row in rows {
                let record = Arc::new(record_from_row(&meta, row, self.engine.time_offset())?);
                commands.push(RemoteCommand::HSet {
                    key: key.clone(),
                    field: record.id().to_string(),
                    value: record.snapshot()?,
                });
                if let Some(local) = &local {
                    local.set(record.id(), record.clone());
                }
                found.insert(record.id(), Some(record));
            }
            for id in missing {
                if found.contains_key(&id) {
                    continue;
                }
                commands.push(RemoteCommand::HSetNx {
                    key: key.clone(),
                    field: id.to_string(),
                    value: NEGATIVE_MARKER.to_vec(),
                });
                if let Some(local) = &local {
                    local.set_absent(id);
                }
                found.insert(id, None);
            }
            if let Some(remote) = &remote {
                remote.pipeline(&commands).await?;
            }
        }

        Ok(ids.iter().map(|id| found.get(id).cloned().flatten()).collect())
    }

    /// Records of `entity` whose `reference` field holds `id`, ordered by id.
    pub async fn get_by_reference(&self, entity: &str, reference: &str, id: u64) -> Result<Vec<Arc<Record>>, OrmError> {
        let meta = self.engine.metadata(entity)?;
        let definition = meta
            .reference(reference)
            .ok_or_else(|| OrmError::Registration(format!("{} has no reference {}", entity, reference)))?;
        if id == 0 {
            return Ok(Vec::new());
        }
        let filter = Filter::Equals {
            column: definition.column.clone(),
            value: SqlValue::Uint(id),
        };
        let cached = definition.cached;
        self.load_collection(&meta, reference, id, cached, filter).await
    }

    /// Every record of `entity`, ordered by id.
    pub async fn load_all(&self, entity: &str) -> Result<Vec<Arc<Record>>, OrmError> {
        let meta = self.engine.metadata(entity)?;
        let cached = meta.cache_all;
        self.load_collection(&meta, ALL_REFERENCE, 0, cached, Filter::All).await
    }

    async fn load_collection(
        &self,
        meta: &Arc<EntityMetadata>,
        reference: &str,
        id: u64,
        cached: bool,
        filter: Filter,
    ) -> Result<Vec<Arc<Record>>, OrmError> {
        let local = self.engine.local_cache_for(meta).filter(|_| cached);
        let remote = self.engine.remote_cache_for(meta).filter(|_| cached);

        if let Some(local) = &local {
            if let Some(records) = local.get_reference(reference, id) {
                record_lookup(Tier::Local, &meta.name, LookupOutcome::Hit);
                return Ok(records.to_vec());
            }
            record_lookup(Tier::Local, &meta.name, LookupOutcome::Miss);
        }

        let key = reference_key(meta, reference, id);
        if let Some(remote) = &remote {
            let members = remote.smembers(&key).await?;
            if members.iter().any(|member| member == VALID_MARKER) {
                record_lookup(Tier::Remote, &meta.name, LookupOutcome::Hit);
                let mut ids: Vec<u64> = members.iter().filter_map(|member| member.parse().ok()).collect();
                ids.sort_unstable();
                let records: Vec<Arc<Record>> = self.get_by_ids(&meta.name, &ids).await?.into_iter().flatten().collect();
                if let Some(local) = &local {
                    local.set_reference(reference, id, Arc::from(records.clone()));
                }
                return Ok(records);
            }
            record_lookup(Tier::Remote, &meta.name, LookupOutcome::Miss);
        }

        let pool = self.engine.pool(&meta.storage_pool)?;
        let rows = pool.query(&select(meta, filter)).await?;
        let offset = self.engine.time_offset();
        let mut records = rows
            .into_iter()
            .map(|row| record_from_row(meta, row, offset).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|record| record.id());
        record_lookup(Tier::Storage, &meta.name, LookupOutcome::Hit);

        if let Some(remote) = &remote {
            let mut members: Vec<String> = records.iter().map(|record| record.id().to_string()).collect();
            members.push(VALID_MARKER.to_string());
            remote.sadd(&key, &members).await?;
        }
        if let Some(local) = &local {
            local.set_reference(reference, id, Arc::from(records.clone()));
        }
        debug!(entity = %meta.name, reference, id, rows = records.len(), "Collection loaded from storage");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryRemoteCache;
    use crate::coordinator::OrmEngine;
    use crate::schema::{EntitySchema, FieldDescriptor, Registry};
    use crate::storage::InMemoryPool;

    struct Fixture {
        engine: Arc<OrmEngine>,
        pool: Arc<InMemoryPool>,
        remote: Arc<InMemoryRemoteCache>,
    }

    fn fixture() -> Fixture {
        let pool = Arc::new(InMemoryPool::new("default"));
        let remote = Arc::new(InMemoryRemoteCache::new("default"));
        let mut registry = Registry::new();
        registry.register_storage_pool(pool.clone());
        registry.register_remote_cache(remote.clone());
        registry.register_entity(
            EntitySchema::new("Category")
                .field(FieldDescriptor::text("Name"))
                .remote_cache("default")
                .local_cache(0)
                .cache_all(),
        );
        registry.register_entity(
            EntitySchema::new("Product")
                .field(FieldDescriptor::text("Name"))
                .field(FieldDescriptor::reference("Category", "Category").nullable())
                .remote_cache("default")
                .local_cache(100)
                .cached_reference("Category"),
        );
        Fixture {
            engine: registry.validate().unwrap(),
            pool,
            remote,
        }
    }

    fn product(f: &Fixture, id: u64, name: &str, category: u64) {
        f.pool.insert_row(
            "Product",
            id,
            vec![("Name", SqlValue::Text(name.into())), ("Category", SqlValue::Uint(category))],
        );
    }

    #[tokio::test]
    async fn test_storage_hit_fills_both_tiers() {
        let f = fixture();
        product(&f, 1, "Pen", 0);
        let ctx = f.engine.context();
        let first = ctx.get_by_id("Product", 1).await.unwrap().unwrap();
        assert_eq!(first.get("Name").unwrap().as_str(), Some("Pen"));
        assert_eq!(f.pool.query_count(), 1);

        let again = ctx.get_by_id("Product", 1).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(f.remote.calls("hget"), 1);

        f.engine.clear_local_caches();
        let from_remote = ctx.get_by_id_lazy("Product", 1).await.unwrap().unwrap();
        assert!(from_remote.is_lazy());
        assert_eq!(from_remote.get_lazy("Name").unwrap().as_str(), Some("Pen"));
        assert_eq!(f.pool.query_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_row_is_cached_negatively() {
        let f = fixture();
        let ctx = f.engine.context();
        assert!(ctx.get_by_id("Product", 7).await.unwrap().is_none());
        assert!(ctx.get_by_id("Product", 7).await.unwrap().is_none());
        f.engine.clear_local_caches();
        assert!(ctx.get_by_id("Product", 7).await.unwrap().is_none());
        assert_eq!(f.pool.query_count(), 1);
    }

    #[tokio::test]
    async fn test_negative_marker_never_overwrites() {
        let f = fixture();
        let ctx = f.engine.context();
        assert!(ctx.get_by_id("Product", 7).await.unwrap().is_none());
        assert!(ctx.get_by_ids("Product", &[8]).await.unwrap()[0].is_none());
        assert_eq!(f.remote.calls("hsetnx"), 2);
        assert_eq!(f.remote.calls("hset"), 0);
    }

    #[tokio::test]
    async fn test_get_by_ids_preserves_order_and_queries_once() {
        let f = fixture();
        product(&f, 1, "a", 0);
        product(&f, 2, "b", 0);
        let ctx = f.engine.context();
        let records = ctx.get_by_ids("Product", &[2, 9, 1, 2]).await.unwrap();
        let ids: Vec<Option<u64>> = records.iter().map(|r| r.as_ref().map(|r| r.id())).collect();
        assert_eq!(ids, vec![Some(2), None, Some(1), Some(2)]);
        assert_eq!(f.pool.query_count(), 1);

        f.engine.clear_local_caches();
        let again = ctx.get_by_ids("Product", &[1, 9]).await.unwrap();
        assert!(again[0].is_some() && again[1].is_none());
        assert_eq!(f.pool.query_count(), 1);
        assert_eq!(f.remote.calls("hmget"), 2);
    }

    #[tokio::test]
    async fn test_reference_collection_cached_in_both_tiers() {
        let f = fixture();
        product(&f, 3, "c", 5);
        product(&f, 1, "a", 5);
        product(&f, 2, "b", 6);
        let ctx = f.engine.context();
        let records = ctx.get_by_reference("Product", "Category", 5).await.unwrap();
        assert_eq!(records.iter().map(|r| r.id()).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(f.pool.query_count(), 1);

        ctx.get_by_reference("Product", "Category", 5).await.unwrap();
        assert_eq!(f.remote.calls("smembers"), 1);

        f.engine.clear_local_caches();
        let from_remote = ctx.get_by_reference("Product", "Category", 5).await.unwrap();
        assert_eq!(from_remote.len(), 2);
        // set members from remote, rows from remote entity hash or storage
        assert_eq!(f.remote.calls("smembers"), 2);
    }

    #[tokio::test]
    async fn test_unknown_reference_is_registration_error() {
        let f = fixture();
        let ctx = f.engine.context();
        let err = ctx.get_by_reference("Product", "Shop", 1).await.unwrap_err();
        assert!(matches!(err, OrmError::Registration(_)));
    }

    #[tokio::test]
    async fn test_load_all_uses_all_collection() {
        let f = fixture();
        f.pool.insert_row("Category", 1, vec![("Name", SqlValue::Text("x".into()))]);
        let ctx = f.engine.context();
        assert_eq!(ctx.load_all("Category").await.unwrap().len(), 1);
        assert_eq!(ctx.load_all("Category").await.unwrap().len(), 1);
        assert_eq!(f.pool.query_count(), 1);
        assert!(f.remote.contains_key(&reference_key(&f.engine.metadata("Category").unwrap(), ALL_REFERENCE, 0)));
    }
}
