// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

use crate::query::lookup::LookupPredicate;
use crate::record::{FieldMap, Record, RecordId};
use crate::schema::ModelSchema;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Operation timed out after {0} ms")]
    Timeout(u64),
}

/// Result of a batch write
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchWriteResult {
    /// Number of keys written
    pub written: usize,
}

/// Key-value cache with per-key TTL. Keys are UTF-8, values are JSON text.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value. `ttl_secs = None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), StorageError>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Every key matching a glob pattern (`*` wildcard only).
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StorageError>;

    /// Read several keys; the result lines up with `keys`.
    /// Default implementation falls back to sequential gets.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StorageError> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Write several entries with one TTL (pipelined for Redis).
    /// Default implementation falls back to sequential sets.
    async fn set_many(
        &self,
        entries: &[(String, String)],
        ttl_secs: Option<u64>,
    ) -> Result<BatchWriteResult, StorageError> {
        for (key, value) in entries {
            self.set(key, value, ttl_secs).await?;
        }
        Ok(BatchWriteResult {
            written: entries.len(),
        })
    }

    /// Remove several keys. Returns how many existed.
    async fn delete_many(&self, keys: &[String]) -> Result<usize, StorageError> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Relational source of truth, queried per model.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Records of `schema`'s model matching `predicates`.
    ///
    /// Implementations may apply only part of the predicates (or none); the
    /// caller re-checks every record. Single-valued relations should come back
    /// loaded one level deep where the store can do so cheaply.
    async fn query(
        &self,
        schema: &ModelSchema,
        predicates: &[LookupPredicate],
    ) -> Result<Vec<Record>, StorageError>;

    /// Insert a new record. The store assigns the id.
    async fn insert(&self, schema: &ModelSchema, fields: FieldMap) -> Result<Record, StorageError>;

    /// Apply `fields` to an existing record. [`StorageError::NotFound`] if missing.
    async fn update_by_id(
        &self,
        schema: &ModelSchema,
        id: RecordId,
        fields: FieldMap,
    ) -> Result<Record, StorageError>;

    /// Delete a record. Returns whether it existed.
    async fn delete_by_id(&self, schema: &ModelSchema, id: RecordId) -> Result<bool, StorageError>;
}
