// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::remote::{CacheError, RemoteCache};

enum Entry {
    Hash(HashMap<String, Vec<u8>>),
    Set(BTreeSet<String>),
    List(Vec<Vec<u8>>),
}

/// Process-local [`RemoteCache`] for tests and single-node setups.
///
/// Counts calls per command and can be switched into a failing state.
pub struct InMemoryRemoteCache {
    code: String,
    data: DashMap<String, Entry>,
    calls: DashMap<&'static str, u64>,
    failing: AtomicBool,
}

impl InMemoryRemoteCache {
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            data: DashMap::new(),
            calls: DashMap::new(),
            failing: AtomicBool::new(false),
        }
    }

    /// Number of `command` calls so far (e.g. "hget").
    pub fn calls(&self, command: &str) -> u64 {
        self.calls.get(command).map(|c| *c).unwrap_or(0)
    }

    /// Make every subsequent call fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    fn enter(&self, command: &'static str) -> Result<(), CacheError> {
        *self.calls.entry(command).or_insert(0) += 1;
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Connection(format!("{} unavailable", self.code)));
        }
        Ok(())
    }
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::Backend(format!("WRONGTYPE operation against key {}", key))
}

fn list_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl RemoteCache for InMemoryRemoteCache {
    fn code(&self) -> &str {
        &self.code
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.enter("hget")?;
        match self.data.get(key).as_deref() {
            None => Ok(None),
            Some(Entry::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        self.enter("hmget")?;
        match self.data.get(key).as_deref() {
            None => Ok(vec![None; fields.len()]),
            Some(Entry::Hash(hash)) => Ok(fields.iter().map(|f| hash.get(f).cloned()).collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), CacheError> {
        self.enter("hset")?;
        let mut entry = self.data.entry(key.to_string()).or_insert_with(|| Entry::Hash(HashMap::new()));
        match entry.value_mut() {
            Entry::Hash(hash) => {
                hash.insert(field.to_string(), value.to_vec());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &[u8]) -> Result<bool, CacheError> {
        self.enter("hsetnx")?;
        let mut entry = self.data.entry(key.to_string()).or_insert_with(|| Entry::Hash(HashMap::new()));
        match entry.value_mut() {
            Entry::Hash(hash) => {
                if hash.contains_key(field) {
                    return Ok(false);
                }
                hash.insert(field.to_string(), value.to_vec());
                Ok(true)
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<(), CacheError> {
        self.enter("hdel")?;
        let emptied = match self.data.get_mut(key).as_deref_mut() {
            None => return Ok(()),
            Some(Entry::Hash(hash)) => {
                for field in fields {
                    hash.remove(field);
                }
                hash.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
        };
        if emptied {
            self.data.remove(key);
        }
        Ok(())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, CacheError> {
        self.enter("hincrby")?;
        let mut entry = self.data.entry(key.to_string()).or_insert_with(|| Entry::Hash(HashMap::new()));
        match entry.value_mut() {
            Entry::Hash(hash) => {
                let current = match hash.get(field) {
                    Some(raw) => String::from_utf8_lossy(raw)
                        .parse::<i64>()
                        .map_err(|_| CacheError::Backend("hash value is not an integer".into()))?,
                    None => 0,
                };
                let next = current + delta;
                hash.insert(field.to_string(), next.to_string().into_bytes());
                Ok(next)
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheError> {
        self.enter("smembers")?;
        match self.data.get(key).as_deref() {
            None => Ok(Vec::new()),
            Some(Entry::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), CacheError> {
        self.enter("sadd")?;
        let mut entry = self.data.entry(key.to_string()).or_insert_with(|| Entry::Set(BTreeSet::new()));
        match entry.value_mut() {
            Entry::Set(set) => {
                set.extend(members.iter().cloned());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64, CacheError> {
        self.enter("rpush")?;
        let mut entry = self.data.entry(key.to_string()).or_insert_with(|| Entry::List(Vec::new()));
        match entry.value_mut() {
            Entry::List(list) => {
                list.extend(values.iter().cloned());
                Ok(list.len() as u64)
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Vec<u8>>, CacheError> {
        self.enter("lrange")?;
        match self.data.get(key).as_deref() {
            None => Ok(Vec::new()),
            Some(Entry::List(list)) => Ok(match list_range(list.len(), start, stop) {
                Some((from, to)) => list[from..=to].to_vec(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn llen(&self, key: &str) -> Result<u64, CacheError> {
        self.enter("llen")?;
        match self.data.get(key).as_deref() {
            None => Ok(0),
            Some(Entry::List(list)) => Ok(list.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), CacheError> {
        self.enter("ltrim")?;
        let emptied = match self.data.get_mut(key).as_deref_mut() {
            None => return Ok(()),
            Some(Entry::List(list)) => {
                *list = match list_range(list.len(), start, stop) {
                    Some((from, to)) => list[from..=to].to_vec(),
                    None => Vec::new(),
                };
                list.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
        };
        if emptied {
            self.data.remove(key);
        }
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<(), CacheError> {
        self.enter("del")?;
        for key in keys {
            self.data.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RemoteCommand;

    #[tokio::test]
    async fn test_hash_commands() {
        let cache = InMemoryRemoteCache::new("default");
        assert_eq!(cache.hget("h", "a").await.unwrap(), None);
        cache.hset("h", "a", b"1").await.unwrap();
        assert!(!cache.hset_nx("h", "a", b"2").await.unwrap());
        assert!(cache.hset_nx("h", "b", b"2").await.unwrap());
        assert_eq!(
            cache.hmget("h", &["a".into(), "x".into(), "b".into()]).await.unwrap(),
            vec![Some(b"1".to_vec()), None, Some(b"2".to_vec())]
        );
        assert_eq!(cache.hincr_by("h", "a", 5).await.unwrap(), 6);
        cache.hdel("h", &["a".into(), "b".into()]).await.unwrap();
        assert!(!cache.contains_key("h"));
        assert_eq!(cache.calls("hget"), 1);
    }

    #[tokio::test]
    async fn test_pipeline_hset_nx_keeps_existing_field() {
        let cache = InMemoryRemoteCache::new("default");
        cache.hset("h", "a", b"row").await.unwrap();
        cache
            .pipeline(&[
                RemoteCommand::HSetNx { key: "h".into(), field: "a".into(), value: b"-".to_vec() },
                RemoteCommand::HSetNx { key: "h".into(), field: "b".into(), value: b"-".to_vec() },
            ])
            .await
            .unwrap();
        assert_eq!(cache.hget("h", "a").await.unwrap(), Some(b"row".to_vec()));
        assert_eq!(cache.hget("h", "b").await.unwrap(), Some(b"-".to_vec()));
    }

    #[tokio::test]
    async fn test_list_range_semantics() {
        let cache = InMemoryRemoteCache::new("default");
        let values: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i]).collect();
        assert_eq!(cache.rpush("l", &values).await.unwrap(), 5);
        assert_eq!(cache.lrange("l", 0, -1).await.unwrap().len(), 5);
        assert_eq!(cache.lrange("l", -2, -1).await.unwrap(), vec![vec![3], vec![4]]);
        assert_eq!(cache.lrange("l", 10, 20).await.unwrap(), Vec::<Vec<u8>>::new());
        cache.ltrim("l", -2, -1).await.unwrap();
        assert_eq!(cache.llen("l").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_wrong_type_and_failure_injection() {
        let cache = InMemoryRemoteCache::new("default");
        cache.sadd("s", &["1".into()]).await.unwrap();
        assert!(cache.hget("s", "x").await.is_err());

        cache.set_failing(true);
        assert!(matches!(cache.smembers("s").await, Err(CacheError::Connection(_))));
        cache.set_failing(false);
        assert_eq!(cache.smembers("s").await.unwrap(), vec!["1".to_string()]);
    }
}
