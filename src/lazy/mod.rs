// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write-behind flushing through a durable queue.
//!
//! A context publishes its pending operations as one event. Consumers in a
//! shared group read events in pages, apply them through the flush executor
//! and acknowledge them afterwards, so every event is applied at least once.
//!
//! ```text
//! Context::flush_lazy ──► EventBus (stream) ──► LazyFlushConsumer worker(s)
//!                                                 │ whole page in a transaction
//!                                                 │ on storage error: one op at a time,
//!                                                 │   resolvers repair / discard
//!                                                 └─► ack, or leave pending + error log
//! ```

pub mod consumer;
pub mod event_bus;
pub mod memory;
pub mod redis_stream;
pub mod statistics;

pub use consumer::{LazyFlushConsumer, LazyFlushErrorResolver, Resolution};
pub use event_bus::{EventBus, QueueEvent};
pub use memory::InMemoryEventBus;
pub use redis_stream::RedisStreamBus;
pub use statistics::{LazyFlushError, LazyFlushStatistics};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flush::PendingOperation;

#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("event bus backend error: {0}")]
    Backend(String),
    #[error("event bus connection error: {0}")]
    Connection(String),
}

/// Payload of one queued event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LazyEvent {
    pub operations: Vec<PendingOperation>,
}

/// List holding unresolved events of `stream`.
pub(crate) fn error_log_key(stream: &str) -> String {
    format!("{}:errors", stream)
}
