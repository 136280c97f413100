// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event_bus::EventBus;
use super::error_log_key;
use crate::cache::RemoteCache;
use crate::error::OrmError;
use crate::flush::PendingOperation;

/// An event the consumer could not apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LazyFlushError {
    pub event_id: String,
    pub operations: Vec<PendingOperation>,
    pub error: String,
    pub time: DateTime<Utc>,
}

/// Queue depth and error log of one lazy flush stream.
pub struct LazyFlushStatistics {
    bus: Arc<dyn EventBus>,
    log: Option<Arc<dyn RemoteCache>>,
    stream: String,
}

impl LazyFlushStatistics {
    pub(crate) fn new(bus: Arc<dyn EventBus>, log: Option<Arc<dyn RemoteCache>>, stream: String) -> Self {
        Self { bus, log, stream }
    }

    /// Events waiting in the stream, pending ones included.
    pub async fn events_count(&self) -> Result<u64, OrmError> {
        Ok(self.bus.stream_len(&self.stream).await?)
    }

    pub async fn errors_count(&self) -> Result<u64, OrmError> {
        match &self.log {
            Some(log) => Ok(log.llen(&error_log_key(&self.stream)).await?),
            None => Ok(0),
        }
    }

    /// Oldest `limit` logged errors (0 = all).
    pub async fn errors(&self, limit: usize) -> Result<Vec<LazyFlushError>, OrmError> {
        let Some(log) = &self.log else {
            return Ok(Vec::new());
        };
        let stop = if limit == 0 { -1 } else { limit as isize - 1 };
        let raw = log.lrange(&error_log_key(&self.stream), 0, stop).await?;
        raw.iter()
            .map(|entry| serde_json::from_slice(entry).map_err(OrmError::from))
            .collect()
    }

    /// Keep only the newest `keep` errors.
    pub async fn trim_errors(&self, keep: usize) -> Result<(), OrmError> {
        let Some(log) = &self.log else {
            return Ok(());
        };
        let key = error_log_key(&self.stream);
        if keep == 0 {
            log.del(&[key]).await?;
        } else {
            log.ltrim(&key, -(keep as isize), -1).await?;
        }
        Ok(())
    }
}

/// Append `entry` to the error log of `stream`, keeping at most `limit`.
pub(crate) async fn log_error(
    log: &dyn RemoteCache,
    stream: &str,
    entry: &LazyFlushError,
    limit: usize,
) -> Result<(), OrmError> {
    let key = error_log_key(stream);
    let length = log.rpush(&key, &[serde_json::to_vec(entry)?]).await?;
    if limit > 0 && length > limit as u64 {
        log.ltrim(&key, -(limit as isize), -1).await?;
    }
    Ok(())
}
