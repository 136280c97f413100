// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Streams event bus.
//!
//! ```text
//! XADD {prefix}{stream} * payload <json>
//! XGROUP CREATE {prefix}{stream} {group} 0 MKSTREAM
//! XREADGROUP GROUP {group} {consumer} COUNT n STREAMS {stream} 0   (own pending)
//! XREADGROUP GROUP {group} {consumer} COUNT n BLOCK ms STREAMS {stream} >
//! XACK + XDEL
//! ```

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{cmd, pipe, AsyncCommands, Client, RedisError};
use tracing::{debug, warn};

use super::event_bus::{EventBus, QueueEvent};
use super::QueueError;
use crate::resilience::retry::{retry, RetryConfig};

const PAYLOAD_FIELD: &str = "payload";

fn map_redis_error(e: RedisError) -> QueueError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        QueueError::Connection(e.to_string())
    } else {
        QueueError::Backend(e.to_string())
    }
}

pub struct RedisStreamBus {
    connection: ConnectionManager,
    prefix: String,
}

impl RedisStreamBus {
    /// Connect with startup-mode retry.
    pub async fn new(connection_string: &str, prefix: Option<&str>) -> Result<Self, QueueError> {
        let client = Client::open(connection_string).map_err(map_redis_error)?;
        let connection = retry("redis_stream_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(map_redis_error)?;
        Ok(Self::from_connection(connection, prefix))
    }

    /// Share an existing connection, e.g. the remote cache's.
    pub fn from_connection(connection: ConnectionManager, prefix: Option<&str>) -> Self {
        Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        }
    }

    fn key(&self, stream: &str) -> String {
        format!("{}{}", self.prefix, stream)
    }

    async fn read_from(
        &self,
        key: &str,
        start: &str,
        options: &StreamReadOptions,
    ) -> Result<Vec<QueueEvent>, QueueError> {
        let mut conn = self.connection.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[key], &[start], options)
            .await
            .map_err(map_redis_error)?;
        let mut events = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in stream.ids {
                // entries deleted while pending come back without fields
                let payload: Vec<u8> = entry.get(PAYLOAD_FIELD).unwrap_or_default();
                events.push(QueueEvent { id: entry.id, payload });
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl EventBus for RedisStreamBus {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), QueueError> {
        let mut conn = self.connection.clone();
        let created: Result<(), RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(self.key(stream))
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => {
                debug!(stream, group, "Consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error(e)),
        }
    }

    async fn publish(&self, stream: &str, payload: &[u8]) -> Result<String, QueueError> {
        let mut conn = self.connection.clone();
        cmd("XADD")
            .arg(self.key(stream))
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<QueueEvent>, QueueError> {
        let key = self.key(stream);
        let pending_options = StreamReadOptions::default().group(group, consumer).count(count);
        let pending = self.read_from(&key, "0", &pending_options).await?;
        if !pending.is_empty() {
            warn!(stream, consumer, events = pending.len(), "Redelivering pending events");
            return Ok(pending);
        }

        let mut options = StreamReadOptions::default().group(group, consumer).count(count);
        if let Some(block) = block {
            options = options.block(block.as_millis() as usize);
        }
        self.read_from(&key, ">", &options).await
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), QueueError> {
        if ids.is_empty() {
            return Ok(());
        }
        let key = self.key(stream);
        let mut conn = self.connection.clone();
        let mut pipeline = pipe();
        pipeline.cmd("XACK").arg(&key).arg(group).arg(ids).ignore();
        pipeline.cmd("XDEL").arg(&key).arg(ids).ignore();
        pipeline.query_async::<()>(&mut conn).await.map_err(map_redis_error)
    }

    async fn stream_len(&self, stream: &str) -> Result<u64, QueueError> {
        let mut conn = self.connection.clone();
        cmd("XLEN")
            .arg(self.key(stream))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }
}
