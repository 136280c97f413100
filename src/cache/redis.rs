// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for the remote cache tier.
//!
//! Snapshots live in one hash per entity type (field = id), which lets
//! multi-id reads use a single `HMGET`. Reference collections are Redis sets
//! carrying the valid marker. Commands are issued through a shared
//! `ConnectionManager`; only the initial connect is retried.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client, RedisError};

use super::remote::{CacheError, RemoteCache, RemoteCommand};
use crate::resilience::retry::{retry, RetryConfig};

pub struct RedisCache {
    code: String,
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "shop:" → "shop:User:3f2a")
    prefix: String,
}

pub(crate) fn map_redis_error(e: RedisError) -> CacheError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        CacheError::Connection(e.to_string())
    } else {
        CacheError::Backend(e.to_string())
    }
}

impl RedisCache {
    /// Connect with startup-mode retry (fails fast if the URL is wrong).
    pub async fn new(code: impl Into<String>, connection_string: &str, prefix: Option<&str>) -> Result<Self, CacheError> {
        let client = Client::open(connection_string).map_err(map_redis_error)?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(map_redis_error)?;

        Ok(Self::from_connection(code, connection, prefix))
    }

    pub fn from_connection(code: impl Into<String>, connection: ConnectionManager, prefix: Option<&str>) -> Self {
        Self {
            code: code.into(),
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        }
    }

    /// Clone of the connection manager, shared with the stream event bus.
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    fn prefixed_keys(&self, keys: &[String]) -> Vec<String> {
        keys.iter().map(|k| self.prefixed_key(k)).collect()
    }
}

#[async_trait]
impl RemoteCache for RedisCache {
    fn code(&self) -> &str {
        &self.code
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.connection.clone();
        cmd("HGET")
            .arg(self.prefixed_key(key))
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        cmd("HMGET")
            .arg(self.prefixed_key(key))
            .arg(fields)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: () = cmd("HSET")
            .arg(self.prefixed_key(key))
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &[u8]) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        cmd("HSETNX")
            .arg(self.prefixed_key(key))
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<(), CacheError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _: () = cmd("HDEL")
            .arg(self.prefixed_key(key))
            .arg(fields)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, CacheError> {
        let mut conn = self.connection.clone();
        cmd("HINCRBY")
            .arg(self.prefixed_key(key))
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.connection.clone();
        cmd("SMEMBERS")
            .arg(self.prefixed_key(key))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), CacheError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _: () = cmd("SADD")
            .arg(self.prefixed_key(key))
            .arg(members)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64, CacheError> {
        let mut conn = self.connection.clone();
        cmd("RPUSH")
            .arg(self.prefixed_key(key))
            .arg(values)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Vec<u8>>, CacheError> {
        let mut conn = self.connection.clone();
        cmd("LRANGE")
            .arg(self.prefixed_key(key))
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn llen(&self, key: &str) -> Result<u64, CacheError> {
        let mut conn = self.connection.clone();
        cmd("LLEN")
            .arg(self.prefixed_key(key))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: () = cmd("LTRIM")
            .arg(self.prefixed_key(key))
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _: () = cmd("DEL")
            .arg(self.prefixed_keys(keys))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    /// One round trip for the whole batch.
    async fn pipeline(&self, commands: &[RemoteCommand]) -> Result<(), CacheError> {
        if commands.is_empty() {
            return Ok(());
        }
        let mut pipeline = pipe();
        for command in commands {
            match command {
                RemoteCommand::HSet { key, field, value } => {
                    pipeline.cmd("HSET").arg(self.prefixed_key(key)).arg(field).arg(value.as_slice()).ignore();
                }
                RemoteCommand::HSetNx { key, field, value } => {
                    pipeline.cmd("HSETNX").arg(self.prefixed_key(key)).arg(field).arg(value.as_slice()).ignore();
                }
                RemoteCommand::HDel { key, fields } if !fields.is_empty() => {
                    pipeline.cmd("HDEL").arg(self.prefixed_key(key)).arg(fields).ignore();
                }
                RemoteCommand::SAdd { key, members } if !members.is_empty() => {
                    pipeline.cmd("SADD").arg(self.prefixed_key(key)).arg(members).ignore();
                }
                RemoteCommand::Del { keys } if !keys.is_empty() => {
                    pipeline.cmd("DEL").arg(self.prefixed_keys(keys)).ignore();
                }
                _ => {}
            }
        }
        let mut conn = self.connection.clone();
        let _: () = pipeline.query_async(&mut conn).await.map_err(map_redis_error)?;
        Ok(())
    }
}
