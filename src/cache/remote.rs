// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("remote cache backend error: {0}")]
    Backend(String),
    #[error("remote cache connection error: {0}")]
    Connection(String),
}

/// Write command for [`RemoteCache::pipeline`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    HSet { key: String, field: String, value: Vec<u8> },
    /// Written only when the field is unset.
    HSetNx { key: String, field: String, value: Vec<u8> },
    HDel { key: String, fields: Vec<String> },
    SAdd { key: String, members: Vec<String> },
    Del { keys: Vec<String> },
}

/// Networked key/value cache: second read tier and unique-key lock surface.
///
/// Every call is a network round trip; nothing here retries.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    fn code(&self) -> &str;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError>;
    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), CacheError>;
    /// Returns false when the field already existed.
    async fn hset_nx(&self, key: &str, field: &str, value: &[u8]) -> Result<bool, CacheError>;
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<(), CacheError>;
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, CacheError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheError>;
    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), CacheError>;

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64, CacheError>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Vec<u8>>, CacheError>;
    async fn llen(&self, key: &str) -> Result<u64, CacheError>;
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), CacheError>;

    async fn del(&self, keys: &[String]) -> Result<(), CacheError>;

    /// Execute writes in one batch.
    /// Default implementation falls back to sequential calls.
    async fn pipeline(&self, commands: &[RemoteCommand]) -> Result<(), CacheError> {
        for command in commands {
            match command {
                RemoteCommand::HSet { key, field, value } => self.hset(key, field, value).await?,
                RemoteCommand::HSetNx { key, field, value } => {
                    self.hset_nx(key, field, value).await?;
                }
                RemoteCommand::HDel { key, fields } => self.hdel(key, fields).await?,
                RemoteCommand::SAdd { key, members } => self.sadd(key, members).await?,
                RemoteCommand::Del { keys } => self.del(keys).await?,
            }
        }
        Ok(())
    }
}
