// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Statement execution for pending operations.
//!
//! Operations are grouped by (pool, entity) in order of first appearance.
//! Inside a group deletes run first, then one multi-row insert, then one
//! update per record. Unique index values of inserted and updated rows are
//! reserved in the remote cache with `HSETNX` before the statement runs and
//! released again if it fails.
//!
//! Without a transaction every statement commits on its own: a failing group
//! aborts the flush but statements already executed stay applied, and their
//! cache invalidation still happens. With [`flush_in_transaction`] caches are
//! only touched after every pool committed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use super::operation::PendingOperation;
use crate::cache::{
    entity_key, reference_key, unique_key, EntityLocalCache, RemoteCache, RemoteCommand, NEGATIVE_MARKER,
};
use crate::codec::{self, Bind, SqlValue, Value};
use crate::coordinator::OrmEngine;
use crate::error::{DuplicateKeyError, OrmError};
use crate::record::Record;
use crate::schema::{EntityMetadata, ALL_REFERENCE};
use crate::storage::{rows_per_insert, StoragePool, StorageTransaction, WriteStatement, MAX_BIND_PARAMETERS};

/// Execute `operations`, each statement committing independently.
#[tracing::instrument(skip_all, fields(operations = operations.len()))]
pub(crate) async fn flush(engine: &OrmEngine, operations: Vec<PendingOperation>) -> Result<(), OrmError> {
    if operations.is_empty() {
        return Ok(());
    }
    let start = Instant::now();
    let groups = group(engine, operations)?;
    let mut executor = FlushExecutor::new(engine, HashMap::new());
    for group in &groups {
        let result = executor.execute_group(group).await;
        let invalidated = executor.apply_invalidations().await;
        result?;
        invalidated?;
    }
    crate::metrics::record_flush_latency("sync", start.elapsed());
    Ok(())
}

/// Execute `operations` inside one transaction per touched pool.
#[tracing::instrument(skip_all, fields(operations = operations.len()))]
pub(crate) async fn flush_in_transaction(engine: &OrmEngine, operations: Vec<PendingOperation>) -> Result<(), OrmError> {
    if operations.is_empty() {
        return Ok(());
    }
    let start = Instant::now();
    let groups = group(engine, operations)?;

    let mut transactions: HashMap<String, Box<dyn StorageTransaction>> = HashMap::new();
    for group in &groups {
        if transactions.contains_key(&group.pool_code) {
            continue;
        }
        match group.pool.begin().await {
            Ok(tx) => {
                transactions.insert(group.pool_code.clone(), tx);
            }
            Err(e) => {
                rollback_all(transactions).await;
                return Err(e.into());
            }
        }
    }

    let mut executor = FlushExecutor::new(engine, transactions);
    let mut outcome = Ok(());
    for group in &groups {
        if let Err(e) = executor.execute_group(group).await {
            outcome = Err(e);
            break;
        }
    }
    let transactions = std::mem::take(&mut executor.transactions);
    if let Err(e) = outcome {
        rollback_all(transactions).await;
        executor.release_all().await;
        return Err(e);
    }
    for (code, tx) in transactions {
        if let Err(e) = tx.commit().await {
            error!(pool = %code, error = %e, "Commit failed");
            executor.release_all().await;
            return Err(e.into());
        }
    }
    executor.apply_invalidations().await?;
    crate::metrics::record_flush_latency("transaction", start.elapsed());
    Ok(())
}

async fn rollback_all(transactions: HashMap<String, Box<dyn StorageTransaction>>) {
    for (code, tx) in transactions {
        if let Err(e) = tx.rollback().await {
            warn!(pool = %code, error = %e, "Rollback failed");
        }
    }
}

struct Group {
    pool_code: String,
    pool: Arc<dyn StoragePool>,
    meta: Arc<EntityMetadata>,
    deletes: Vec<PendingOperation>,
    inserts: Vec<PendingOperation>,
    updates: Vec<PendingOperation>,
}

fn group(engine: &OrmEngine, operations: Vec<PendingOperation>) -> Result<Vec<Group>, OrmError> {
    let mut groups: Vec<Group> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for operation in operations {
        let position = match positions.get(operation.entity()) {
            Some(position) => *position,
            None => {
                let meta = engine.metadata(operation.entity())?;
                let pool = engine.pool(&meta.storage_pool)?;
                groups.push(Group {
                    pool_code: meta.storage_pool.clone(),
                    pool,
                    meta,
                    deletes: Vec::new(),
                    inserts: Vec::new(),
                    updates: Vec::new(),
                });
                positions.insert(operation.entity().to_string(), groups.len() - 1);
                groups.len() - 1
            }
        };
        let group = &mut groups[position];
        match operation {
            PendingOperation::Delete { .. } => group.deletes.push(operation),
            PendingOperation::Insert { .. } => group.inserts.push(operation),
            PendingOperation::Update { .. } => group.updates.push(operation),
        }
    }
    Ok(groups)
}

/// A unique value held in the remote cache on behalf of one row.
struct Reservation {
    cache: Arc<dyn RemoteCache>,
    key: String,
    field: String,
    /// Holder to put back on rollback instead of deleting the entry.
    previous: Option<Vec<u8>>,
}

enum LocalAction {
    Set(u64, Arc<Record>),
    Absent(u64),
    Remove(u64),
    RemoveReference(String, u64),
}

#[derive(Default)]
struct Invalidation {
    local: Vec<(Arc<EntityLocalCache>, LocalAction)>,
    remote: HashMap<String, (Arc<dyn RemoteCache>, Vec<RemoteCommand>)>,
}

struct FlushExecutor<'a> {
    engine: &'a OrmEngine,
    transactions: HashMap<String, Box<dyn StorageTransaction>>,
    /// Reservations made by statements that succeeded.
    reserved: Vec<Reservation>,
    /// Unique values released once the flush is durable.
    releases: Vec<Reservation>,
    /// Unique values of rows deleted in this flush, with the deleted id.
    vacated: HashMap<(String, String), u64>,
    invalidation: Invalidation,
}

impl<'a> FlushExecutor<'a> {
    fn new(engine: &'a OrmEngine, transactions: HashMap<String, Box<dyn StorageTransaction>>) -> Self {
        Self {
            engine,
            transactions,
            reserved: Vec::new(),
            releases: Vec::new(),
            vacated: HashMap::new(),
            invalidation: Invalidation::default(),
        }
    }

    async fn execute_group(&mut self, group: &Group) -> Result<(), OrmError> {
        if !group.deletes.is_empty() {
            self.delete(group).await?;
        }
        if !group.inserts.is_empty() {
            self.insert(group).await?;
        }
        for update in &group.updates {
            self.update(group, update).await?;
        }
        Ok(())
    }

    async fn exec(&self, group: &Group, statement: WriteStatement) -> Result<u64, OrmError> {
        let rows = match self.transactions.get(&group.pool_code) {
            Some(tx) => tx.exec(&statement).await?,
            None => group.pool.exec(&statement).await?,
        };
        debug!(
            entity = %group.meta.name,
            pool = %group.pool_code,
            kind = statement.kind(),
            rows,
            "Statement executed"
        );
        crate::metrics::record_statement(&group.meta.name, statement.kind(), rows as usize);
        Ok(rows)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Statements
    // ═══════════════════════════════════════════════════════════════════════

    async fn delete(&mut self, group: &Group) -> Result<(), OrmError> {
        let meta = &group.meta;
        let offset = self.engine.time_offset();
        let mut states = Vec::with_capacity(group.deletes.len());
        for operation in &group.deletes {
            if let PendingOperation::Delete { id, snapshot, .. } = operation {
                let values = codec::decode(&meta.layout, snapshot)?;
                let bind = codec::full_bind(&meta.layout, &values, offset)?;
                states.push((*id, values, bind));
            }
        }

        for batch in states.chunks(MAX_BIND_PARAMETERS) {
            let ids = batch.iter().map(|(id, _, _)| *id).collect();
            self.exec(group, WriteStatement::Delete { table: meta.table.clone(), ids }).await?;
            for (id, values, bind) in batch {
                if let Some(cache) = self.engine.reservation_cache(meta) {
                    for (key, field) in unique_fields(meta, bind) {
                        self.vacated.insert((key.clone(), field.clone()), *id);
                        self.releases.push(Reservation { cache: cache.clone(), key, field, previous: None });
                    }
                }
                self.invalidate(meta, *id, Change::Deleted, &[values.as_slice()]);
            }
        }
        Ok(())
    }

    async fn insert(&mut self, group: &Group) -> Result<(), OrmError> {
        let meta = &group.meta;
        let mut columns = vec!["ID".to_string()];
        columns.extend(meta.columns().iter().cloned());

        let offset = self.engine.time_offset();
        let restore = self.transactions.contains_key(&group.pool_code);
        let mut rows = Vec::new();
        let mut inserted = Vec::new();
        // one entry per row, aligned with `rows`
        let mut reserved: Vec<Vec<Reservation>> = Vec::new();
        for operation in &group.inserts {
            let PendingOperation::Insert { id, bind, snapshot, on_duplicate, .. } = operation else {
                continue;
            };
            let row = row_values(&columns, *id, bind);
            if let Some(update) = on_duplicate {
                // the final row state is unknown, so no reservation and no cache write
                let statement = WriteStatement::Insert {
                    table: meta.table.clone(),
                    columns: columns.clone(),
                    rows: vec![row],
                    on_duplicate: Some(update.clone()),
                };
                self.exec(group, statement).await?;
                let values = codec::decode(&meta.layout, snapshot)?;
                self.invalidate(meta, *id, Change::Upserted, &[values.as_slice()]);
                continue;
            }
            // caches get what storage will hold, which a repaired bind may change
            let stored = codec::values_from_row(&meta.layout, row[1..].to_vec(), offset)
                .map_err(OrmError::from)
                .and_then(|values| Ok((codec::encode(&meta.layout, &values)?, values)));
            let (snapshot, values) = match stored {
                Ok(stored) => stored,
                Err(e) => {
                    release(reserved.into_iter().flatten().collect()).await;
                    return Err(e);
                }
            };
            match self.reserve(meta, *id, bind, restore).await {
                Ok(made) => reserved.push(made),
                Err(e) => {
                    release(reserved.into_iter().flatten().collect()).await;
                    return Err(e);
                }
            }
            inserted.push((*id, snapshot, values));
            rows.push(row);
        }

        let per_statement = rows_per_insert(columns.len());
        let mut rows = rows.into_iter();
        let mut reserved = reserved.into_iter();
        let mut inserted = inserted.into_iter();
        loop {
            let batch: Vec<Vec<SqlValue>> = rows.by_ref().take(per_statement).collect();
            if batch.is_empty() {
                return Ok(());
            }
            let count = batch.len();
            let batch_reserved: Vec<Reservation> = reserved.by_ref().take(count).flatten().collect();
            let statement = WriteStatement::Insert {
                table: meta.table.clone(),
                columns: columns.clone(),
                rows: batch,
                on_duplicate: None,
            };
            if let Err(e) = self.exec(group, statement).await {
                release(batch_reserved.into_iter().chain(reserved.flatten()).collect()).await;
                return Err(e);
            }
            self.reserved.extend(batch_reserved);

            for (id, snapshot, values) in inserted.by_ref().take(count) {
                let record = Arc::new(Record::lazy(meta.clone(), id, Arc::from(snapshot.as_slice())));
                self.invalidate(meta, id, Change::Inserted(record, snapshot), &[values.as_slice()]);
            }
        }
    }

    async fn update(&mut self, group: &Group, operation: &PendingOperation) -> Result<(), OrmError> {
        let PendingOperation::Update { id, new, source, snapshot, .. } = operation else {
            return Ok(());
        };
        let meta = &group.meta;
        let offset = self.engine.time_offset();
        let before = codec::decode(&meta.layout, source)?;
        let after = codec::decode(&meta.layout, snapshot)?;

        // only indexes whose columns changed need a new reservation
        let touches_index = meta
            .unique_indexes
            .iter()
            .any(|index| index.columns.iter().any(|c| new.contains_key(c)));
        let mut reserved = Vec::new();
        let mut stale = Vec::new();
        if touches_index {
            let old_bind = codec::full_bind(&meta.layout, &before, offset)?;
            let new_bind = codec::full_bind(&meta.layout, &after, offset)?;
            let restore = self.transactions.contains_key(&group.pool_code);
            reserved = self.reserve(meta, *id, &new_bind, restore).await?;
            let current = unique_fields(meta, &new_bind);
            stale = unique_fields(meta, &old_bind)
                .into_iter()
                .filter(|entry| !current.contains(entry))
                .collect();
        }

        let statement = WriteStatement::Update {
            table: meta.table.clone(),
            id: *id,
            bind: new.clone(),
        };
        if let Err(e) = self.exec(group, statement).await {
            release(reserved).await;
            return Err(e);
        }
        self.reserved.extend(reserved);
        if let Some(cache) = self.engine.reservation_cache(meta) {
            for (key, field) in stale {
                self.releases.push(Reservation { cache: cache.clone(), key, field, previous: None });
            }
        }
        self.invalidate(meta, *id, Change::Updated, &[before.as_slice(), after.as_slice()]);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Unique reservations
    // ═══════════════════════════════════════════════════════════════════════

    /// Reserve every unique value of a row. A value already held by this id
    /// (a replayed operation) counts as reserved, and a value held by a row
    /// deleted earlier in this flush is taken over. With `restore` a rollback
    /// hands a taken-over value back to the deleted row.
    async fn reserve(
        &mut self,
        meta: &EntityMetadata,
        id: u64,
        bind: &Bind,
        restore: bool,
    ) -> Result<Vec<Reservation>, OrmError> {
        let Some(cache) = self.engine.reservation_cache(meta) else {
            return Ok(Vec::new());
        };
        let holder_value = id.to_string();
        let mut made = Vec::new();
        for index in &meta.unique_indexes {
            let Some(field) = unique_field(&index.columns, bind) else {
                continue;
            };
            let key = unique_key(meta, &index.name);
            let claimed = match cache.hset_nx(&key, &field, holder_value.as_bytes()).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    release(made).await;
                    return Err(e.into());
                }
            };
            if claimed {
                made.push(Reservation { cache: cache.clone(), key, field, previous: None });
                continue;
            }
            let holder = match cache.hget(&key, &field).await {
                Ok(raw) => raw.and_then(|raw| String::from_utf8_lossy(&raw).parse::<u64>().ok()),
                Err(e) => {
                    release(made).await;
                    return Err(e.into());
                }
            };
            if holder == Some(id) {
                continue;
            }
            let slot = (key, field);
            if let Some(deleted) = holder.filter(|h| self.vacated.get(&slot) == Some(h)) {
                let (key, field) = slot;
                if let Err(e) = cache.hset(&key, &field, holder_value.as_bytes()).await {
                    release(made).await;
                    return Err(e.into());
                }
                debug!(entity = %meta.name, index = %index.name, from = deleted, to = id, "Unique value taken over");
                self.vacated.remove(&(key.clone(), field.clone()));
                self.releases.retain(|r| !(r.key == key && r.field == field));
                let previous = restore.then(|| deleted.to_string().into_bytes());
                made.push(Reservation { cache: cache.clone(), key, field, previous });
                continue;
            }
            release(made).await;
            crate::metrics::record_duplicate_key(&meta.name, &index.name);
            return Err(DuplicateKeyError {
                index: index.name.clone(),
                id: holder.unwrap_or(0),
                columns: index.columns.clone(),
            }
            .into());
        }
        Ok(made)
    }

    async fn release_all(&mut self) {
        release(std::mem::take(&mut self.reserved)).await;
        self.releases.clear();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Cache invalidation
    // ═══════════════════════════════════════════════════════════════════════

    fn invalidate(&mut self, meta: &Arc<EntityMetadata>, id: u64, change: Change, states: &[&[Value]]) {
        let local = self.engine.local_cache_for(meta);
        let remote = self.engine.remote_cache_for(meta);

        let mut evicted: Vec<(String, u64)> = Vec::new();
        for values in states {
            for reference in meta.cached_references() {
                if let Some(target) = values.get(reference.field_index).and_then(Value::as_u64) {
                    let entry = (reference.name.clone(), target);
                    if !evicted.contains(&entry) {
                        evicted.push(entry);
                    }
                }
            }
        }
        if meta.cache_all {
            evicted.push((ALL_REFERENCE.to_string(), 0));
        }

        if let Some(local) = local {
            let action = match &change {
                Change::Inserted(record, _) => LocalAction::Set(id, record.clone()),
                Change::Deleted => LocalAction::Absent(id),
                Change::Updated | Change::Upserted => LocalAction::Remove(id),
            };
            self.invalidation.local.push((local.clone(), action));
            for (reference, target) in &evicted {
                self.invalidation
                    .local
                    .push((local.clone(), LocalAction::RemoveReference(reference.clone(), *target)));
            }
        }

        if let Some(remote) = remote {
            let key = entity_key(meta);
            let field = id.to_string();
            let mut commands = vec![match change {
                Change::Inserted(_, snapshot) => RemoteCommand::HSet { key, field, value: snapshot },
                Change::Deleted => RemoteCommand::HSet { key, field, value: NEGATIVE_MARKER.to_vec() },
                Change::Updated | Change::Upserted => RemoteCommand::HDel { key, fields: vec![field] },
            }];
            let keys: Vec<String> = evicted
                .iter()
                .map(|(reference, target)| reference_key(meta, reference, *target))
                .collect();
            if !keys.is_empty() {
                commands.push(RemoteCommand::Del { keys });
            }
            self.invalidation
                .remote
                .entry(remote.code().to_string())
                .or_insert_with(|| (remote.clone(), Vec::new()))
                .1
                .extend(commands);
        }
    }

    /// Apply queued cache changes and unique releases.
    async fn apply_invalidations(&mut self) -> Result<(), OrmError> {
        let invalidation = std::mem::take(&mut self.invalidation);
        for (cache, action) in invalidation.local {
            match action {
                LocalAction::Set(id, record) => cache.set(id, record),
                LocalAction::Absent(id) => cache.set_absent(id),
                LocalAction::Remove(id) => cache.remove(id),
                LocalAction::RemoveReference(reference, id) => cache.remove_reference(&reference, id),
            }
        }
        release(std::mem::take(&mut self.releases)).await;
        let mut failure = None;
        for (code, (cache, commands)) in invalidation.remote {
            if let Err(e) = cache.pipeline(&commands).await {
                error!(cache = %code, error = %e, "Remote cache invalidation failed");
                failure = Some(e);
            }
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

enum Change {
    Inserted(Arc<Record>, Vec<u8>),
    Updated,
    Upserted,
    Deleted,
}

fn row_values(columns: &[String], id: u64, bind: &Bind) -> Vec<SqlValue> {
    columns
        .iter()
        .map(|column| match column.as_str() {
            "ID" => SqlValue::Uint(id),
            other => bind.get(other).cloned().unwrap_or(SqlValue::Null),
        })
        .collect()
}

/// Hash field for a unique index: indexed values joined by ":", or `None`
/// when any of them is null.
fn unique_field(columns: &[String], bind: &Bind) -> Option<String> {
    let parts: Option<Vec<String>> = columns
        .iter()
        .map(|column| bind.get(column).filter(|v| !v.is_null()).map(SqlValue::render))
        .collect();
    parts.map(|parts| parts.join(":"))
}

fn unique_fields(meta: &EntityMetadata, bind: &Bind) -> Vec<(String, String)> {
    meta.unique_indexes
        .iter()
        .filter_map(|index| unique_field(&index.columns, bind).map(|field| (unique_key(meta, &index.name), field)))
        .collect()
}

async fn release(reservations: Vec<Reservation>) {
    for reservation in reservations {
        let result = match &reservation.previous {
            Some(holder) => reservation.cache.hset(&reservation.key, &reservation.field, holder).await,
            None => reservation.cache.hdel(&reservation.key, &[reservation.field.clone()]).await,
        };
        if let Err(e) = result {
            warn!(key = %reservation.key, error = %e, "Failed to release unique reservation");
        }
    }
}
