// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the ORM engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `tiered_orm_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: local, remote, storage
//! - `entity`: entity name
//! - `outcome`: hit, absent, miss

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a cache or storage lookup result
pub fn record_lookup(tier: &str, entity: &str, outcome: &str) {
    counter!(
        "tiered_orm_lookups_total",
        "tier" => tier.to_string(),
        "entity" => entity.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record LRU evictions in a local cache
pub fn record_eviction(cache: &str) {
    counter!("tiered_orm_local_evictions_total", "cache" => cache.to_string()).increment(1);
}

/// Record one executed write statement
pub fn record_statement(entity: &str, kind: &str, rows: usize) {
    counter!(
        "tiered_orm_statements_total",
        "entity" => entity.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
    counter!(
        "tiered_orm_rows_written_total",
        "entity" => entity.to_string(),
        "kind" => kind.to_string()
    )
    .increment(rows as u64);
}

/// Record a unique index collision
pub fn record_duplicate_key(entity: &str, index: &str) {
    counter!(
        "tiered_orm_duplicate_keys_total",
        "entity" => entity.to_string(),
        "index" => index.to_string()
    )
    .increment(1);
}

/// Record flush duration
pub fn record_flush_latency(mode: &str, duration: Duration) {
    histogram!("tiered_orm_flush_seconds", "mode" => mode.to_string())
        .record(duration.as_secs_f64());
}

/// Record lazy events by status (published, acked, failed, discarded)
pub fn record_lazy_events(status: &str, count: usize) {
    counter!("tiered_orm_lazy_events_total", "status" => status.to_string())
        .increment(count as u64);
}

/// Record one consumed lazy page
pub fn record_lazy_page(events: usize, duration: Duration) {
    histogram!("tiered_orm_lazy_page_size").record(events as f64);
    histogram!("tiered_orm_lazy_page_seconds").record(duration.as_secs_f64());
}

/// Set current entry count of a local cache
pub fn set_local_cache_entries(cache: &str, count: usize) {
    gauge!("tiered_orm_local_cache_entries", "cache" => cache.to_string()).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder every call is a no-op; this guards the
    // macro invocations against panics.
    #[test]
    fn test_metrics_without_recorder() {
        record_lookup("local", "User", "hit");
        record_eviction("User");
        record_statement("User", "insert", 3);
        record_duplicate_key("User", "Email");
        record_flush_latency("sync", Duration::from_millis(5));
        record_lazy_events("acked", 2);
        record_lazy_page(2, Duration::from_millis(1));
        set_local_cache_entries("User", 10);
    }
}
