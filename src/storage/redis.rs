// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis cache store.
//!
//! Values are plain Redis strings holding the JSON mapping:
//!
//! ```text
//! SET test_caching:Task:42 '{"id":42,"status":"new",...}' EX 300
//! ```
//!
//! Keys are already fully qualified (`{prefix}:{model}:{id}`) by the caller,
//! so the store adds no namespace of its own. Enumeration uses `SCAN MATCH`
//! rather than `KEYS` to avoid blocking the server.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client};

use super::traits::{BatchWriteResult, CacheStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

/// Keys requested per `SCAN` round trip.
const SCAN_COUNT: usize = 500;

pub struct RedisCacheStore {
    connection: ConnectionManager,
}

fn backend(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

impl RedisCacheStore {
    /// Connect, retrying with the startup policy.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use model_cache_sync::storage::redis::RedisCacheStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let cache = RedisCacheStore::new("redis://localhost:6379").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(backend)?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(backend)?;

        Ok(Self { connection })
    }

    /// Wrap an existing connection (shared with the host).
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    /// Get a clone of the connection manager
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.connection.clone();
        retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            async move {
                let value: Option<String> = cmd("GET").arg(key).query_async(&mut conn).await?;
                Ok(value)
            }
        })
        .await
        .map_err(backend)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        retry("redis_set", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            async move {
                let mut command = cmd("SET");
                command.arg(key).arg(value);
                if let Some(ttl) = ttl_secs {
                    command.arg("EX").arg(ttl);
                }
                let _: () = command.query_async(&mut conn).await?;
                Ok(())
            }
        })
        .await
        .map_err(backend)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        retry("redis_delete", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            async move {
                let removed: u64 = cmd("DEL").arg(key).query_async(&mut conn).await?;
                Ok(removed > 0)
            }
        })
        .await
        .map_err(backend)
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let conn = self.connection.clone();
            let (next, batch): (u64, Vec<String>) =
                retry("redis_scan", &RetryConfig::query(), || {
                    let mut conn = conn.clone();
                    async move {
                        cmd("SCAN")
                            .arg(cursor)
                            .arg("MATCH")
                            .arg(pattern)
                            .arg("COUNT")
                            .arg(SCAN_COUNT)
                            .query_async(&mut conn)
                            .await
                    }
                })
                .await
                .map_err(backend)?;

            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connection.clone();
        retry("redis_mget", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            async move {
                let values: Vec<Option<String>> = cmd("MGET").arg(keys).query_async(&mut conn).await?;
                Ok(values)
            }
        })
        .await
        .map_err(backend)
    }

    /// Pipelined `SET ... [EX ttl]` for every entry.
    async fn set_many(
        &self,
        entries: &[(String, String)],
        ttl_secs: Option<u64>,
    ) -> Result<BatchWriteResult, StorageError> {
        if entries.is_empty() {
            return Ok(BatchWriteResult::default());
        }
        let conn = self.connection.clone();
        retry("redis_set_many", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            async move {
                let mut pipeline = pipe();
                for (key, value) in entries {
                    let command = pipeline.cmd("SET").arg(key).arg(value);
                    if let Some(ttl) = ttl_secs {
                        command.arg("EX").arg(ttl);
                    }
                    command.ignore();
                }
                pipeline.query_async::<()>(&mut conn).await?;
                Ok(())
            }
        })
        .await
        .map_err(backend)?;

        Ok(BatchWriteResult {
            written: entries.len(),
        })
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let conn = self.connection.clone();
        retry("redis_delete_many", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            async move {
                let removed: u64 = cmd("DEL").arg(keys).query_async(&mut conn).await?;
                Ok(removed as usize)
            }
        })
        .await
        .map_err(backend)
    }
}
