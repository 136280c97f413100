// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lazy flush consumer.
//!
//! A page of events is first applied as one unit, inside a transaction on
//! every pool it touches. When that fails with a recoverable storage error
//! the page is replayed one operation at a time without a transaction, and
//! each failing operation is offered to the registered resolvers. An event
//! is acknowledged once all its operations are applied or resolved; the
//! first unresolved operation stops the page, leaves its event pending and
//! returns the original error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::event_bus::{EventBus, QueueEvent};
use super::statistics::{log_error, LazyFlushError};
use super::LazyEvent;
use crate::config::LazyFlushConfig;
use crate::coordinator::OrmEngine;
use crate::error::OrmError;
use crate::flush::executor;
use crate::flush::PendingOperation;
use crate::resilience::retry::RetryConfig;
use crate::storage::{Filter, SelectQuery, StorageError};

/// What a resolver decided about a failed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Apply this operation instead.
    Repaired(PendingOperation),
    /// Drop the operation; the event can be acknowledged.
    Discard,
    /// Let the next resolver try.
    Unresolved,
}

/// Hook consulted when a single operation fails with a recoverable storage
/// error.
pub trait LazyFlushErrorResolver: Send + Sync {
    fn resolve(&self, operation: &PendingOperation, error: &StorageError) -> Resolution;
}

impl<F> LazyFlushErrorResolver for F
where
    F: Fn(&PendingOperation, &StorageError) -> Resolution + Send + Sync,
{
    fn resolve(&self, operation: &PendingOperation, error: &StorageError) -> Resolution {
        self(operation, error)
    }
}

#[derive(Clone)]
pub struct LazyFlushConsumer {
    engine: Arc<OrmEngine>,
    bus: Arc<dyn EventBus>,
    config: LazyFlushConfig,
    name: String,
    resolvers: Vec<Arc<dyn LazyFlushErrorResolver>>,
    group_ready: Arc<AtomicBool>,
}

struct DecodedEvent {
    id: String,
    operations: Vec<PendingOperation>,
}

impl LazyFlushConsumer {
    pub(crate) fn new(engine: Arc<OrmEngine>, bus: Arc<dyn EventBus>, config: LazyFlushConfig) -> Self {
        Self {
            engine,
            bus,
            config,
            name: format!("consumer-{}", Uuid::new_v4()),
            resolvers: Vec::new(),
            group_ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fixed consumer name; a restarted consumer with the same name picks up
    /// the events its predecessor left pending.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register_resolver(&mut self, resolver: impl LazyFlushErrorResolver + 'static) {
        self.resolvers.push(Arc::new(resolver));
    }

    async fn ensure_group(&self) -> Result<(), OrmError> {
        if !self.group_ready.load(Ordering::Acquire) {
            self.bus.ensure_group(&self.config.stream, &self.config.group).await?;
            self.group_ready.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Read and apply one page without waiting. Returns the number of events
    /// acknowledged.
    pub async fn digest_page(&self) -> Result<usize, OrmError> {
        self.ensure_group().await?;
        let events = self.read(None).await?;
        if events.is_empty() {
            return Ok(0);
        }
        self.process(events).await
    }

    /// Apply pages until the stream has nothing left for this consumer.
    pub async fn digest(&self) -> Result<usize, OrmError> {
        let mut total = 0;
        loop {
            let processed = self.digest_page().await?;
            if processed == 0 {
                return Ok(total);
            }
            total += processed;
        }
    }

    /// Run `workers` consumers until `stop` turns true. Each worker finishes
    /// the page it is applying before it exits.
    #[tracing::instrument(skip_all, fields(stream = %self.config.stream, group = %self.config.group))]
    pub async fn run(&self, stop: watch::Receiver<bool>) -> Result<(), OrmError> {
        self.ensure_group().await?;
        let workers = self.config.workers.max(1);
        info!(workers, consumer = %self.name, "Lazy flush consumer started");

        let mut set = JoinSet::new();
        for index in 0..workers {
            let mut worker = self.clone();
            if workers > 1 {
                worker.name = format!("{}-{}", self.name, index);
            }
            let stop = stop.clone();
            set.spawn(async move { worker.work(stop).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Lazy flush worker panicked");
            }
        }
        info!(consumer = %self.name, "Lazy flush consumer stopped");
        Ok(())
    }

    async fn work(&self, mut stop: watch::Receiver<bool>) {
        let backoff = RetryConfig::worker();
        let mut delay = backoff.initial_delay;
        let block = Duration::from_millis(self.config.block_ms);
        loop {
            if *stop.borrow() {
                return;
            }
            let events = tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                events = self.read(Some(block)) => events,
            };
            let result = match events {
                Ok(events) if events.is_empty() => Ok(0),
                Ok(events) => self.process(events).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => delay = backoff.initial_delay,
                Err(e) => {
                    warn!(consumer = %self.name, error = %e, retry_in = ?delay, "Lazy flush page failed");
                    tokio::select! {
                        _ = stop.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = backoff.next_delay(delay);
                }
            }
        }
    }

    async fn read(&self, block: Option<Duration>) -> Result<Vec<QueueEvent>, OrmError> {
        Ok(self
            .bus
            .read(
                &self.config.stream,
                &self.config.group,
                &self.name,
                self.config.page_size.max(1),
                block,
            )
            .await?)
    }

    async fn ack(&self, ids: &[String]) -> Result<(), OrmError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.bus.ack(&self.config.stream, &self.config.group, ids).await?;
        crate::metrics::record_lazy_events("acked", ids.len());
        Ok(())
    }

    async fn process(&self, events: Vec<QueueEvent>) -> Result<usize, OrmError> {
        let start = Instant::now();
        let count = events.len();
        let mut decoded = Vec::with_capacity(count);
        let mut poisoned = Vec::new();
        for event in events {
            match serde_json::from_slice::<LazyEvent>(&event.payload) {
                Ok(payload) => decoded.push(DecodedEvent {
                    id: event.id,
                    operations: payload.operations,
                }),
                Err(e) => {
                    error!(event = %event.id, error = %e, "Dropping undecodable lazy event");
                    self.log_unresolved(&event.id, Vec::new(), &e.to_string()).await;
                    poisoned.push(event.id);
                }
            }
        }
        self.ack(&poisoned).await?;

        let operations: Vec<PendingOperation> = decoded.iter().flat_map(|e| e.operations.iter().cloned()).collect();
        match executor::flush_in_transaction(&self.engine, operations).await {
            Ok(()) => {
                let ids: Vec<String> = decoded.iter().map(|e| e.id.clone()).collect();
                self.ack(&ids).await?;
            }
            Err(e) if e.recoverable_storage_error().is_some() => {
                debug!(error = %e, events = decoded.len(), "Page failed, applying operations one by one");
                self.process_one_by_one(decoded).await?;
            }
            Err(e) => return Err(e),
        }
        crate::metrics::record_lazy_page(count, start.elapsed());
        Ok(count)
    }

    async fn process_one_by_one(&self, events: Vec<DecodedEvent>) -> Result<(), OrmError> {
        for event in events {
            for operation in &event.operations {
                if let Err(e) = self.apply(operation).await {
                    crate::metrics::record_lazy_events("failed", 1);
                    error!(event = %event.id, entity = operation.entity(), id = operation.id(), error = %e, "Unresolved lazy flush error");
                    self.log_unresolved(&event.id, event.operations.clone(), &e.to_string()).await;
                    return Err(e);
                }
            }
            self.ack(&[event.id]).await?;
        }
        Ok(())
    }

    async fn apply(&self, operation: &PendingOperation) -> Result<(), OrmError> {
        let err = match executor::flush(&self.engine, vec![operation.clone()]).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let Some(storage_error) = err.recoverable_storage_error() else {
            return Err(err);
        };
        if let PendingOperation::Insert { .. } = operation {
            if self.already_stored(operation).await? {
                debug!(entity = operation.entity(), id = operation.id(), "Insert already applied");
                return Ok(());
            }
        }
        for resolver in &self.resolvers {
            match resolver.resolve(operation, &storage_error) {
                Resolution::Repaired(repaired) => {
                    executor::flush(&self.engine, vec![repaired]).await?;
                    return Ok(());
                }
                Resolution::Discard => {
                    crate::metrics::record_lazy_events("discarded", 1);
                    warn!(entity = operation.entity(), id = operation.id(), "Lazy operation discarded by resolver");
                    return Ok(());
                }
                Resolution::Unresolved => {}
            }
        }
        Err(err)
    }

    /// A redelivered insert whose row exists was applied before.
    async fn already_stored(&self, operation: &PendingOperation) -> Result<bool, OrmError> {
        let meta = self.engine.metadata(operation.entity())?;
        let pool = self.engine.pool(&meta.storage_pool)?;
        let rows = pool
            .query(&SelectQuery {
                table: meta.table.clone(),
                columns: Vec::new(),
                filter: Filter::Ids(vec![operation.id()]),
            })
            .await?;
        Ok(!rows.is_empty())
    }

    async fn log_unresolved(&self, event_id: &str, operations: Vec<PendingOperation>, error: &str) {
        let Some(log) = self.engine.default_remote_cache() else {
            return;
        };
        let entry = LazyFlushError {
            event_id: event_id.to_string(),
            operations,
            error: error.to_string(),
            time: Utc::now(),
        };
        if let Err(e) = log_error(log.as_ref(), &self.config.stream, &entry, self.config.error_log_limit).await {
            warn!(error = %e, "Failed to record lazy flush error");
        }
    }
}
