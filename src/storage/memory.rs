// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process backends for both stores.
//!
//! [`InMemoryCacheStore`] honours TTLs against `tokio::time::Instant`, so
//! tests can drive expiry with a paused clock. [`InMemorySourceStore`] keeps
//! one table per model, assigns `max(id) + 1` on insert and loads relations
//! one level deep on read. It applies no predicates itself.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::{Duration, Instant};

use super::traits::{CacheStore, SourceStore, StorageError};
use crate::query::lookup::LookupPredicate;
use crate::record::{FieldMap, FieldValue, Record, RecordId, RelatedRef};
use crate::schema::{ModelSchema, ID_FIELD};

struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Glob match supporting `*` only.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return key.is_empty();
    };
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };
    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // No wildcard at all
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

pub struct InMemoryCacheStore {
    data: DashMap<String, CacheEntry>,
}

impl InMemoryCacheStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Live (unexpired) entry count
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| !e.is_expired(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining TTL of a key; `None` if missing or without expiry.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.data
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.expires_at)
            .map(|at| at - now)
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        let expired = match self.data.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
        };
        if expired {
            self.data.remove_if(key, |_, e| e.is_expired(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), StorageError> {
        let expires_at = ttl_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
        self.data.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let now = Instant::now();
        Ok(self
            .data
            .remove(key)
            .is_some_and(|(_, e)| !e.is_expired(now)))
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let now = Instant::now();
        self.data.retain(|_, e| !e.is_expired(now));
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|e| glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Source store backed by per-model tables in memory.
pub struct InMemorySourceStore {
    tables: DashMap<String, BTreeMap<RecordId, FieldMap>>,
}

impl InMemorySourceStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
        }
    }

    /// Put a record with a known id, replacing any existing one.
    pub fn put_record(&self, record: Record) {
        let fields = detach(record.fields);
        self.tables
            .entry(record.model)
            .or_default()
            .insert(record.id, fields);
    }

    /// Remove a record without going through the trait.
    pub fn remove_record(&self, model: &str, id: RecordId) -> bool {
        self.tables
            .get_mut(model)
            .is_some_and(|mut t| t.remove(&id).is_some())
    }

    /// Stored record, relations as ids.
    #[must_use]
    pub fn record(&self, model: &str, id: RecordId) -> Option<Record> {
        let fields = self.tables.get(model)?.get(&id)?.clone();
        Some(Record {
            model: model.to_string(),
            id,
            fields,
        })
    }

    #[must_use]
    pub fn count(&self, model: &str) -> usize {
        self.tables.get(model).map_or(0, |t| t.len())
    }

    fn resolve(&self, model: &str, id: RecordId) -> RelatedRef {
        match self.record(model, id) {
            Some(record) => RelatedRef::Loaded(Box::new(record)),
            None => RelatedRef::Id(id),
        }
    }

    // Must not be called while holding a table guard.
    fn load(&self, schema: &ModelSchema, id: RecordId, mut fields: FieldMap) -> Record {
        for def in schema.data_fields() {
            let Some(model) = def.field_type.related_model() else {
                continue;
            };
            match fields.get_mut(&def.name) {
                Some(FieldValue::Ref(r)) => *r = self.resolve(model, r.id()),
                Some(FieldValue::RefMany(refs)) => {
                    for r in refs.iter_mut() {
                        *r = self.resolve(model, r.id());
                    }
                }
                _ => {}
            }
        }
        Record {
            model: schema.name().to_string(),
            id,
            fields,
        }
    }
}

impl Default for InMemorySourceStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Store relations as ids only.
fn detach(fields: FieldMap) -> FieldMap {
    fields
        .into_iter()
        .filter(|(name, _)| name != ID_FIELD)
        .map(|(name, value)| {
            let value = match value {
                FieldValue::Ref(r) => FieldValue::Ref(r.to_id()),
                FieldValue::RefMany(refs) => {
                    FieldValue::RefMany(refs.iter().map(RelatedRef::to_id).collect())
                }
                other => other,
            };
            (name, value)
        })
        .collect()
}

fn check_columns(schema: &ModelSchema, fields: &FieldMap) -> Result<(), StorageError> {
    match fields.keys().find(|name| !schema.has_field(name)) {
        Some(name) => Err(StorageError::Backend(format!(
            "no such column: {}.{}",
            schema.table(),
            name
        ))),
        None => Ok(()),
    }
}

#[async_trait]
impl SourceStore for InMemorySourceStore {
    async fn query(
        &self,
        schema: &ModelSchema,
        _predicates: &[LookupPredicate],
    ) -> Result<Vec<Record>, StorageError> {
        let rows: Vec<(RecordId, FieldMap)> = match self.tables.get(schema.name()) {
            Some(table) => table.iter().map(|(id, f)| (*id, f.clone())).collect(),
            None => Vec::new(),
        };
        Ok(rows
            .into_iter()
            .map(|(id, fields)| self.load(schema, id, fields))
            .collect())
    }

    async fn insert(&self, schema: &ModelSchema, fields: FieldMap) -> Result<Record, StorageError> {
        check_columns(schema, &fields)?;
        for def in schema.data_fields() {
            let missing = fields.get(&def.name).map_or(true, FieldValue::is_null);
            if missing && !def.nullable && !def.field_type.is_many() {
                return Err(StorageError::Backend(format!(
                    "NOT NULL constraint failed: {}.{}",
                    schema.table(),
                    def.name
                )));
            }
        }

        let fields = detach(fields);
        let (id, stored) = {
            let mut table = self.tables.entry(schema.name().to_string()).or_default();
            let id = RecordId(table.keys().next_back().map_or(1, |last| last.0 + 1));
            table.insert(id, fields.clone());
            (id, fields)
        };
        Ok(self.load(schema, id, stored))
    }

    async fn update_by_id(
        &self,
        schema: &ModelSchema,
        id: RecordId,
        fields: FieldMap,
    ) -> Result<Record, StorageError> {
        check_columns(schema, &fields)?;
        let stored = {
            let mut table = self
                .tables
                .get_mut(schema.name())
                .ok_or(StorageError::NotFound)?;
            let row = table.get_mut(&id).ok_or(StorageError::NotFound)?;
            row.extend(detach(fields));
            row.clone()
        };
        Ok(self.load(schema, id, stored))
    }

    async fn delete_by_id(&self, schema: &ModelSchema, id: RecordId) -> Result<bool, StorageError> {
        Ok(self.remove_record(schema.name(), id))
    }
}
