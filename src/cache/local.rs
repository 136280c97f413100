// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process cache.
//!
//! Values live in a `DashMap`, so lookups never take a segment-wide lock.
//! Bounded segments additionally keep an index-linked recency list behind a
//! `parking_lot::Mutex`; that list is the only serialized structure.
//!
//! ```text
//!  entries: DashMap<K, Slot { value, node }>
//!                                    │
//!  recency:  head ⇄ n3 ⇄ n0 ⇄ n7 ⇄ tail     (arena of nodes, free list)
//!            most recent          evicted first
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::CacheEntry;
use crate::record::Record;
use crate::schema::{EntityMetadata, ALL_REFERENCE};

struct Node<K> {
    key: K,
    prev: Option<usize>,
    next: Option<usize>,
}

struct RecencyList<K> {
    nodes: Vec<Option<Node<K>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<K: Eq + Clone> RecencyList<K> {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    fn push_front(&mut self, key: K) -> usize {
        let node = Node { key, prev: None, next: None };
        let index = match self.free.pop() {
            Some(index) => {
                self.nodes[index] = Some(node);
                index
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.link_front(index);
        self.len += 1;
        index
    }

    fn link_front(&mut self, index: usize) {
        let old_head = self.head;
        if let Some(node) = self.nodes[index].as_mut() {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(head) = self.nodes[h].as_mut() {
                head.prev = Some(index);
            }
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = match self.nodes[index].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(node) = self.nodes[p].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.nodes[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    /// Slots are reused, so callers holding a stale index are ignored.
    fn holds(&self, index: usize, key: &K) -> bool {
        matches!(self.nodes.get(index), Some(Some(node)) if &node.key == key)
    }

    fn touch(&mut self, index: usize, key: &K) {
        if self.holds(index, key) && self.head != Some(index) {
            self.unlink(index);
            self.link_front(index);
        }
    }

    fn remove(&mut self, index: usize, key: &K) {
        if self.holds(index, key) {
            self.unlink(index);
            self.nodes[index] = None;
            self.free.push(index);
            self.len -= 1;
        }
    }

    fn pop_back(&mut self) -> Option<K> {
        let index = self.tail?;
        self.unlink(index);
        self.free.push(index);
        self.len -= 1;
        self.nodes[index].take().map(|node| node.key)
    }
}

struct Slot<V> {
    value: V,
    node: Option<usize>,
}

/// Observability snapshot of one cache segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheUsage {
    pub cache: String,
    /// 0 = unbounded
    pub limit: usize,
    pub used: usize,
    pub evictions: u64,
}

/// One LRU (or unbounded when `limit == 0`) key/value segment.
pub struct LruSegment<K, V> {
    name: String,
    limit: usize,
    entries: DashMap<K, Slot<V>>,
    recency: Mutex<RecencyList<K>>,
    evictions: AtomicU64,
}

impl<K, V> LruSegment<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: impl Into<String>, limit: usize) -> Self {
        Self {
            name: name.into(),
            limit,
            entries: DashMap::new(),
            recency: Mutex::new(RecencyList::new()),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.limit > 0
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let (value, node) = {
            let slot = self.entries.get(key)?;
            (slot.value.clone(), slot.node)
        };
        if let Some(node) = node {
            self.recency.lock().touch(node, key);
        }
        Some(value)
    }

    pub fn set(&self, key: K, value: V) {
        if !self.is_bounded() {
            self.entries.insert(key, Slot { value, node: None });
            return;
        }
        let mut recency = self.recency.lock();
        if let Some(mut slot) = self.entries.get_mut(&key) {
            slot.value = value;
            if let Some(node) = slot.node {
                recency.touch(node, &key);
            }
            return;
        }
        let node = recency.push_front(key.clone());
        self.entries.insert(key, Slot { value, node: Some(node) });
        while recency.len > self.limit {
            let Some(evicted) = recency.pop_back() else { break };
            self.entries.remove(&evicted);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_eviction(&self.name);
        }
    }

    pub fn remove(&self, key: &K) {
        if let Some((_, slot)) = self.entries.remove(key) {
            if let Some(node) = slot.node {
                self.recency.lock().remove(node, key);
            }
        }
    }

    pub fn clear(&self) {
        let mut recency = self.recency.lock();
        self.entries.clear();
        *recency = RecencyList::new();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn usage(&self) -> CacheUsage {
        CacheUsage {
            cache: self.name.clone(),
            limit: self.limit,
            used: self.len(),
            evictions: self.evictions(),
        }
    }
}

/// Materialized reference collection.
pub type RecordList = Arc<[Arc<Record>]>;

struct Segments {
    entities: LruSegment<u64, Option<Arc<Record>>>,
    references: HashMap<String, LruSegment<u64, RecordList>>,
}

impl Segments {
    fn new(meta: &EntityMetadata, limit: usize) -> Self {
        let mut references = HashMap::new();
        for reference in meta.cached_references() {
            let name = format!("{}.{}", meta.name, reference.name);
            references.insert(reference.name.clone(), LruSegment::new(name, limit));
        }
        if meta.cache_all {
            let name = format!("{}.{}", meta.name, ALL_REFERENCE);
            references.insert(ALL_REFERENCE.to_string(), LruSegment::new(name, 0));
        }
        Self {
            entities: LruSegment::new(meta.name.clone(), limit),
            references,
        }
    }
}

/// Local tier for one entity type: entity-by-id plus one segment per cached
/// reference (and the whole-table collection when enabled).
pub struct EntityLocalCache {
    meta: Arc<EntityMetadata>,
    limit: usize,
    segments: RwLock<Arc<Segments>>,
}

impl EntityLocalCache {
    pub fn new(meta: Arc<EntityMetadata>, limit: usize) -> Self {
        let segments = Arc::new(Segments::new(&meta, limit));
        Self {
            meta,
            limit,
            segments: RwLock::new(segments),
        }
    }

    fn current(&self) -> Arc<Segments> {
        self.segments.read().clone()
    }

    pub fn get(&self, id: u64) -> CacheEntry<Arc<Record>> {
        match self.current().entities.get(&id) {
            Some(Some(record)) => CacheEntry::Hit(record),
            Some(None) => CacheEntry::Absent,
            None => CacheEntry::Miss,
        }
    }

    pub fn set(&self, id: u64, record: Arc<Record>) {
        self.current().entities.set(id, Some(record));
    }

    pub fn set_absent(&self, id: u64) {
        self.current().entities.set(id, None);
    }

    pub fn remove(&self, id: u64) {
        self.current().entities.remove(&id);
    }

    pub fn get_reference(&self, reference: &str, id: u64) -> Option<RecordList> {
        self.current().references.get(reference)?.get(&id)
    }

    pub fn set_reference(&self, reference: &str, id: u64, records: RecordList) {
        if let Some(segment) = self.current().references.get(reference) {
            segment.set(id, records);
        }
    }

    pub fn remove_reference(&self, reference: &str, id: u64) {
        if let Some(segment) = self.current().references.get(reference) {
            segment.remove(&id);
        }
    }

    /// Swap in empty segments; readers see either the old or the new set.
    pub fn clear(&self) {
        let fresh = Arc::new(Segments::new(&self.meta, self.limit));
        *self.segments.write() = fresh;
    }

    pub fn usage(&self) -> Vec<CacheUsage> {
        let segments = self.current();
        let mut usage = vec![segments.entities.usage()];
        let mut references: Vec<CacheUsage> = segments.references.values().map(LruSegment::usage).collect();
        references.sort_by(|a, b| a.cache.cmp(&b.cache));
        usage.extend(references);
        crate::metrics::set_local_cache_entries(&self.meta.name, segments.entities.len());
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySchema, FieldDescriptor};

    #[test]
    fn test_unbounded_never_evicts() {
        let segment: LruSegment<u64, u64> = LruSegment::new("t", 0);
        for i in 0..1000 {
            segment.set(i, i);
        }
        assert_eq!(segment.len(), 1000);
        assert_eq!(segment.evictions(), 0);
    }

    #[test]
    fn test_lru_evicts_least_recently_touched() {
        let segment: LruSegment<u64, &str> = LruSegment::new("t", 2);
        segment.set(1, "a");
        segment.set(2, "b");
        assert_eq!(segment.get(&1), Some("a"));
        segment.set(3, "c");

        assert_eq!(segment.get(&2), None);
        assert_eq!(segment.get(&1), Some("a"));
        assert_eq!(segment.get(&3), Some("c"));
        assert_eq!(segment.evictions(), 1);
    }

    #[test]
    fn test_overwrite_does_not_grow() {
        let segment: LruSegment<u64, u64> = LruSegment::new("t", 2);
        segment.set(1, 1);
        segment.set(1, 2);
        segment.set(2, 2);
        assert_eq!(segment.len(), 2);
        assert_eq!(segment.get(&1), Some(2));
        assert_eq!(segment.evictions(), 0);
    }

    #[test]
    fn test_remove_frees_slot_for_reuse() {
        let segment: LruSegment<u64, u64> = LruSegment::new("t", 2);
        segment.set(1, 1);
        segment.set(2, 2);
        segment.remove(&1);
        segment.set(3, 3);
        assert_eq!(segment.evictions(), 0);
        assert_eq!(segment.get(&2), Some(2));
        assert_eq!(segment.get(&3), Some(3));
        segment.set(4, 4);
        assert_eq!(segment.get(&2), None);
        assert_eq!(segment.evictions(), 1);
    }

    #[test]
    fn test_concurrent_access() {
        let segment: Arc<LruSegment<u64, u64>> = Arc::new(LruSegment::new("t", 64));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let segment = segment.clone();
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        segment.set(t * 1000 + i, i);
                        segment.get(&(t * 1000 + i / 2));
                        if i % 7 == 0 {
                            segment.remove(&(t * 1000 + i));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(segment.len() <= 64);
    }

    fn meta() -> Arc<EntityMetadata> {
        let schema = EntitySchema::new("Post")
            .field(FieldDescriptor::reference("Author", "User"))
            .cached_reference("Author")
            .local_cache(10)
            .cache_all();
        Arc::new(EntityMetadata::build(&schema, &HashMap::new()).unwrap())
    }

    #[test]
    fn test_entity_cache_tristate_and_clear() {
        let meta = meta();
        let cache = EntityLocalCache::new(meta.clone(), 10);
        cache.set(1, Arc::new(Record::new(meta, 1)));
        cache.set_absent(2);
        assert!(matches!(cache.get(1), CacheEntry::Hit(_)));
        assert!(matches!(cache.get(2), CacheEntry::Absent));
        assert!(matches!(cache.get(3), CacheEntry::Miss));

        cache.set_reference("Author", 9, Arc::from(Vec::new()));
        assert_eq!(cache.get_reference("Author", 9).map(|l| l.len()), Some(0));

        cache.clear();
        assert!(matches!(cache.get(1), CacheEntry::Miss));
        assert!(cache.get_reference("Author", 9).is_none());
    }

    #[test]
    fn test_usage_lists_every_segment() {
        let cache = EntityLocalCache::new(meta(), 10);
        let usage = cache.usage();
        let names: Vec<&str> = usage.iter().map(|u| u.cache.as_str()).collect();
        assert_eq!(names, vec!["Post", "Post.Author", "Post._all"]);
    }
}
