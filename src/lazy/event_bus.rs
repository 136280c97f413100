// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;

use super::QueueError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEvent {
    pub id: String,
    pub payload: Vec<u8>,
}

/// Durable stream with consumer groups.
///
/// Delivery is at least once: an event stays pending for the consumer that
/// read it until acknowledged.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Create `group` on `stream` if missing, starting at the first entry.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), QueueError>;

    async fn publish(&self, stream: &str, payload: &[u8]) -> Result<String, QueueError>;

    /// Up to `count` events for `consumer`: its own pending events first,
    /// otherwise new ones, waiting up to `block` when none are available.
    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<QueueEvent>, QueueError>;

    /// Acknowledge and remove events.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), QueueError>;

    /// Events still stored in the stream.
    async fn stream_len(&self, stream: &str) -> Result<u64, QueueError>;
}
