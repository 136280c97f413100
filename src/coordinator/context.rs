// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Unit of work.
//!
//! A [`Context`] owns a private [`DirtyTracker`]. Records are tracked
//! through it, then written in one of three ways:
//!
//! - [`Context::flush`]: grouped statements, each committing on its own
//! - [`Context::flush_in_transaction`]: one transaction per touched pool
//! - [`Context::flush_lazy`]: one event on the write-behind queue
//!
//! A successful flush empties the tracker; a failed one leaves it intact.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use super::OrmEngine;
use crate::codec::{Bind, Value};
use crate::error::OrmError;
use crate::flush::executor;
use crate::flush::{DirtyTracker, PendingOperation};
use crate::lazy::LazyEvent;
use crate::record::{Record, RecordState};

pub struct Context {
    pub(super) engine: Arc<OrmEngine>,
    tracker: DirtyTracker,
}

impl Context {
    pub(crate) fn new(engine: Arc<OrmEngine>) -> Self {
        Self {
            engine,
            tracker: DirtyTracker::new(),
        }
    }

    pub fn engine(&self) -> &Arc<OrmEngine> {
        &self.engine
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Tracking
    // ═══════════════════════════════════════════════════════════════════════

    /// Allocate an id and track a fresh record of `entity`.
    pub async fn new_record(&mut self, entity: &str) -> Result<&mut Record, OrmError> {
        let meta = self.engine.metadata(entity)?;
        let id = self.engine.next_id(&meta).await?;
        debug!(entity, id, "New record");
        self.tracker.track(Record::new(meta, id))
    }

    pub fn track(&mut self, record: Record) -> Result<&mut Record, OrmError> {
        self.tracker.track(record)
    }

    /// Editable copy of a loaded record. Editing the same record twice
    /// returns the copy tracked first.
    pub fn edit(&mut self, record: &Record) -> Result<&mut Record, OrmError> {
        if self.tracker.get(record.entity(), record.id()).is_some() {
            return self
                .tracker
                .get_mut(record.entity(), record.id())
                .ok_or_else(|| OrmError::Validation(format!("{} #{} is not tracked", record.entity(), record.id())));
        }
        self.tracker.track(record.clone())
    }

    pub fn delete(&mut self, record: &Record) -> Result<(), OrmError> {
        self.tracker.mark_deleted(record.clone())
    }

    pub fn get_mut(&mut self, entity: &str, id: u64) -> Option<&mut Record> {
        self.tracker.get_mut(entity, id)
    }

    /// `(old, new, dirty)` for a tracked record.
    pub fn is_dirty(&self, entity: &str, id: u64) -> Result<(Bind, Bind, bool), OrmError> {
        self.tracker.is_dirty(entity, id, self.engine.time_offset())
    }

    pub fn pending_operations(&self) -> Result<Vec<PendingOperation>, OrmError> {
        self.tracker.operations(self.engine.time_offset())
    }

    pub fn tracked(&self) -> usize {
        self.tracker.len()
    }

    /// Forget everything tracked without writing it.
    pub fn clear_flush(&mut self) {
        self.tracker.clear();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Flushing
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn flush(&mut self) -> Result<(), OrmError> {
        let operations = self.pending_operations()?;
        executor::flush(&self.engine, operations).await?;
        self.tracker.clear();
        Ok(())
    }

    pub async fn flush_in_transaction(&mut self) -> Result<(), OrmError> {
        let operations = self.pending_operations()?;
        executor::flush_in_transaction(&self.engine, operations).await?;
        self.tracker.clear();
        Ok(())
    }

    /// Queue pending operations as one event instead of writing them.
    ///
    /// Caches are left untouched; reads keep returning the stored state
    /// until a consumer applies the event.
    #[tracing::instrument(skip_all, fields(records = self.tracker.len()))]
    pub async fn flush_lazy(&mut self) -> Result<(), OrmError> {
        self.check_new_references()?;
        let operations = self.pending_operations()?;
        if let Some(op) = operations
            .iter()
            .find(|op| matches!(op, PendingOperation::Insert { on_duplicate: Some(_), .. }))
        {
            return Err(OrmError::Unsupported(format!(
                "lazy flush of {} #{} with on duplicate key update",
                op.entity(),
                op.id()
            )));
        }
        if operations.is_empty() {
            self.tracker.clear();
            return Ok(());
        }

        let bus = self.engine.event_bus()?;
        let count = operations.len();
        let payload = serde_json::to_vec(&LazyEvent { operations })?;
        let event = bus.publish(&self.engine.lazy_config().stream, &payload).await?;
        crate::metrics::record_lazy_events("published", 1);
        debug!(event = %event, operations = count, "Lazy flush queued");
        self.tracker.clear();
        Ok(())
    }

    /// Records referencing another record that is still new in this context
    /// cannot be queued: the consumer may apply them in any page order.
    fn check_new_references(&self) -> Result<(), OrmError> {
        let fresh: HashSet<(&str, u64)> = self
            .tracker
            .records()
            .filter(|record| record.state() == RecordState::New)
            .map(|record| (record.entity(), record.id()))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }
        for record in self.tracker.records() {
            if record.state() == RecordState::Deleted {
                continue;
            }
            let values = record.values()?;
            for reference in &record.metadata().references {
                let Some(target) = values.get(reference.field_index).and_then(Value::as_u64) else {
                    continue;
                };
                if fresh.contains(&(reference.target.as_str(), target)) {
                    return Err(OrmError::Unsupported(format!(
                        "lazy flush of {} #{} referencing new {} #{}",
                        record.entity(),
                        record.id(),
                        reference.target,
                        target
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryRemoteCache;
    use crate::lazy::InMemoryEventBus;
    use crate::schema::{EntitySchema, FieldDescriptor, Registry};
    use crate::storage::InMemoryPool;

    fn engine(remote: bool) -> (Arc<OrmEngine>, Arc<InMemoryPool>) {
        let pool = Arc::new(InMemoryPool::new("default"));
        let mut registry = Registry::new();
        registry.register_storage_pool(pool.clone());
        if remote {
            registry.register_remote_cache(Arc::new(InMemoryRemoteCache::new("default")));
        }
        registry.register_event_bus(Arc::new(InMemoryEventBus::new()));
        registry.register_entity(EntitySchema::new("Category").field(FieldDescriptor::text("Name")));
        registry.register_entity(
            EntitySchema::new("Product")
                .field(FieldDescriptor::text("Name"))
                .field(FieldDescriptor::reference("Category", "Category").nullable()),
        );
        (registry.validate().unwrap(), pool)
    }

    #[tokio::test]
    async fn test_ids_continue_from_storage_max() {
        for remote in [true, false] {
            let (engine, pool) = engine(remote);
            pool.insert_row("Category", 41, vec![("Name", crate::codec::SqlValue::Text("a".into()))]);
            let mut ctx = engine.context();
            assert_eq!(ctx.new_record("Category").await.unwrap().id(), 42);
            assert_eq!(ctx.new_record("Category").await.unwrap().id(), 43);
        }
    }

    #[tokio::test]
    async fn test_flush_clears_tracker_and_empty_flush_is_noop() {
        let (engine, pool) = engine(true);
        let mut ctx = engine.context();
        ctx.flush().await.unwrap();
        assert_eq!(pool.exec_count(), 0);

        ctx.new_record("Category").await.unwrap().set("Name", "Books").unwrap();
        ctx.flush().await.unwrap();
        assert_eq!(ctx.tracked(), 0);
        assert_eq!(pool.row_count("Category"), 1);
    }

    #[tokio::test]
    async fn test_edit_reuses_tracked_copy() {
        let (engine, _) = engine(true);
        let mut ctx = engine.context();
        let id = ctx.new_record("Category").await.unwrap().id();
        ctx.get_mut("Category", id).unwrap().set("Name", "A").unwrap();
        ctx.flush().await.unwrap();

        let loaded = ctx.get_by_id("Category", id).await.unwrap().unwrap();
        ctx.edit(&loaded).unwrap().set("Name", "B").unwrap();
        assert_eq!(ctx.edit(&loaded).unwrap().get("Name").unwrap().as_str(), Some("B"));
        let (old, new, dirty) = ctx.is_dirty("Category", id).unwrap();
        assert!(dirty);
        assert_eq!(old.len(), 1);
        assert_eq!(new.len(), 1);
    }

    #[tokio::test]
    async fn test_lazy_flush_rejects_reference_to_new_record() {
        let (engine, pool) = engine(true);
        let mut ctx = engine.context();
        let category = ctx.new_record("Category").await.unwrap().id();
        let product = ctx.new_record("Product").await.unwrap();
        product.set("Category", Value::Reference(category)).unwrap();

        let err = ctx.flush_lazy().await.unwrap_err();
        assert!(matches!(err, OrmError::Unsupported(_)));
        assert_eq!(ctx.tracked(), 2);
        assert_eq!(pool.exec_count(), 0);
    }

    #[tokio::test]
    async fn test_lazy_flush_rejects_on_duplicate_key_update() {
        let (engine, _) = engine(true);
        let mut ctx = engine.context();
        let record = ctx.new_record("Category").await.unwrap();
        let mut bind = Bind::new();
        bind.insert("Name".into(), crate::codec::SqlValue::Text("x".into()));
        record.set_on_duplicate_key_update(bind);
        assert!(matches!(ctx.flush_lazy().await, Err(OrmError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_lazy_flush_publishes_one_event() {
        let (engine, pool) = engine(true);
        let mut ctx = engine.context();
        ctx.new_record("Category").await.unwrap();
        ctx.new_record("Category").await.unwrap();
        ctx.flush_lazy().await.unwrap();

        assert_eq!(ctx.tracked(), 0);
        assert_eq!(pool.exec_count(), 0);
        let stats = engine.lazy_statistics().unwrap();
        assert_eq!(stats.events_count().await.unwrap(), 1);
    }
}
