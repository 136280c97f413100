// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read tiers.
//!
//! - [`local`]: in-process LRU segments per entity type
//! - [`remote`]: the networked cache interface plus Redis and in-memory backends
//!
//! # Remote key layout
//!
//! ```text
//! {cache_key}                    hash  id -> snapshot | NEGATIVE_MARKER
//! {cache_key}:{index}            hash  indexed values -> id   (unique reservations)
//! {cache_key}:{reference}:{id}   set   member ids + VALID_MARKER
//! {cache_key}:_all:0             set   every id + VALID_MARKER
//! _orm_ids                       hash  entity -> last allocated id
//! ```

pub mod local;
pub mod memory;
pub mod redis;
pub mod remote;

pub use local::{CacheUsage, EntityLocalCache, LruSegment};
pub use memory::InMemoryRemoteCache;
pub use redis::RedisCache;
pub use remote::{CacheError, RemoteCache, RemoteCommand};

use crate::schema::EntityMetadata;

/// Cached "confirmed absent". Snapshots always start with the codec version
/// byte, never 0, so the two cannot collide.
pub const NEGATIVE_MARKER: &[u8] = b"\x00nil";

/// Member marking a reference set as populated. Ids are decimal, so "Y" is
/// never a real member.
pub const VALID_MARKER: &str = "Y";

pub const ID_COUNTER_KEY: &str = "_orm_ids";

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEntry<T> {
    Hit(T),
    /// Negative entry: storage confirmed the value does not exist.
    Absent,
    /// Nothing cached.
    Miss,
}

pub fn entity_key(meta: &EntityMetadata) -> String {
    meta.cache_key.clone()
}

pub fn unique_key(meta: &EntityMetadata, index: &str) -> String {
    format!("{}:{}", meta.cache_key, index)
}

pub fn reference_key(meta: &EntityMetadata, reference: &str, id: u64) -> String {
    format!("{}:{}:{}", meta.cache_key, reference, id)
}

/// Decode a raw remote hash value.
pub fn classify(raw: Option<Vec<u8>>) -> CacheEntry<Vec<u8>> {
    match raw {
        None => CacheEntry::Miss,
        Some(bytes) if bytes == NEGATIVE_MARKER => CacheEntry::Absent,
        Some(bytes) => CacheEntry::Hit(bytes),
    }
}
