// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::event_bus::{EventBus, QueueEvent};
use super::QueueError;

#[derive(Default)]
struct ConsumerGroup {
    last_delivered: u64,
    /// entry id -> consumer holding it
    pending: BTreeMap<u64, String>,
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<u64, Vec<u8>>,
    next_id: u64,
    groups: HashMap<String, ConsumerGroup>,
}

/// Process-local [`EventBus`] with stream semantics.
pub struct InMemoryEventBus {
    streams: Mutex<HashMap<String, Stream>>,
    published: Notify,
    fail_ack: AtomicBool,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            published: Notify::new(),
            fail_ack: AtomicBool::new(false),
        }
    }

    /// Make acknowledgements fail, simulating a consumer dying after apply.
    pub fn set_fail_ack(&self, fail: bool) {
        self.fail_ack.store(fail, Ordering::SeqCst);
    }

    /// Events delivered to some consumer but not yet acknowledged.
    pub fn pending(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn parse_id(id: &str) -> Result<u64, QueueError> {
        id.split('-')
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| QueueError::Backend(format!("invalid event id {}", id)))
    }

    fn format_id(n: u64) -> String {
        format!("{}-0", n)
    }

    fn take(&self, stream: &str, group: &str, consumer: &str, count: usize) -> Result<Vec<QueueEvent>, QueueError> {
        let mut streams = self.streams.lock();
        let stream_state = streams
            .get_mut(stream)
            .ok_or_else(|| QueueError::Backend(format!("NOGROUP no stream {}", stream)))?;
        let Stream { entries, groups, .. } = stream_state;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| QueueError::Backend(format!("NOGROUP no group {} on {}", group, stream)))?;

        let own: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, holder)| holder.as_str() == consumer)
            .map(|(id, _)| *id)
            .take(count)
            .collect();
        if !own.is_empty() {
            return Ok(own
                .into_iter()
                .filter_map(|id| {
                    entries.get(&id).map(|payload| QueueEvent {
                        id: Self::format_id(id),
                        payload: payload.clone(),
                    })
                })
                .collect());
        }

        let fresh: Vec<(u64, Vec<u8>)> = entries
            .range(state.last_delivered + 1..)
            .take(count)
            .map(|(id, payload)| (*id, payload.clone()))
            .collect();
        if let Some((last, _)) = fresh.last() {
            state.last_delivered = *last;
        }
        for (id, _) in &fresh {
            state.pending.insert(*id, consumer.to_string());
        }
        Ok(fresh
            .into_iter()
            .map(|(id, payload)| QueueEvent {
                id: Self::format_id(id),
                payload,
            })
            .collect())
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), QueueError> {
        self.streams
            .lock()
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn publish(&self, stream: &str, payload: &[u8]) -> Result<String, QueueError> {
        let id = {
            let mut streams = self.streams.lock();
            let state = streams.entry(stream.to_string()).or_default();
            state.next_id += 1;
            let id = state.next_id;
            state.entries.insert(id, payload.to_vec());
            id
        };
        self.published.notify_waiters();
        Ok(Self::format_id(id))
    }

    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<QueueEvent>, QueueError> {
        let notified = self.published.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let events = self.take(stream, group, consumer, count)?;
        match block {
            Some(timeout) if events.is_empty() => {
                if tokio::time::timeout(timeout, notified).await.is_err() {
                    return Ok(Vec::new());
                }
                self.take(stream, group, consumer, count)
            }
            _ => Ok(events),
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), QueueError> {
        if self.fail_ack.load(Ordering::SeqCst) {
            return Err(QueueError::Connection("ack failed".into()));
        }
        let mut streams = self.streams.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(());
        };
        for id in ids {
            let id = Self::parse_id(id)?;
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.remove(&id);
            }
            state.entries.remove(&id);
        }
        Ok(())
    }

    async fn stream_len(&self, stream: &str) -> Result<u64, QueueError> {
        Ok(self.streams.lock().get(stream).map(|s| s.entries.len() as u64).unwrap_or(0))
    }
}
