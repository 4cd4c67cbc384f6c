// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache-first CRUD.
//!
//! Reads are answered from the cache only. Writes require `write_through`:
//! the source store is written first (it is the system of record), then the
//! affected keys are rewritten or removed before the call returns.
//!
//! - `get()` / `get_map()` - Lookups against the cached records of a model
//! - `order()` / `order_by()` - Stable sort of returned mappings
//! - `create()` / `update()` / `update_with()` / `delete()` - Write-through

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{CacheSyncError, DeserializationError, PredicateError, SyncResult};
use crate::key::CacheKey;
use crate::metrics;
use crate::query::lookup::LookupPredicate;
use crate::query::matcher::{parse_datetime, parse_decimal, CompiledQuery};
use crate::record::{Mapping, Record, RecordId};
use crate::registry::{Catalog, RegisteredModel};
use crate::schema::{FieldType, ID_FIELD};
use crate::serializer::{decode_fields, deserialize, ModelCatalog};
use crate::storage::traits::StorageError;

use super::{CacheRoot, UpdateOptions};

fn id_only(mapping: &Mapping) -> Mapping {
    mapping
        .iter()
        .filter(|(name, _)| name.as_str() == ID_FIELD)
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Null first, then numbers by value, nested records by id, strings by
/// their declared type (decimals and timestamps by value, anything else
/// lexically).
fn compare_values(a: Option<&Value>, b: Option<&Value>, field_type: Option<&FieldType>) -> Ordering {
    let a = a.unwrap_or(&Value::Null);
    let b = b.unwrap_or(&Value::Null);
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => match field_type {
            Some(FieldType::Decimal) => match (parse_decimal(x), parse_decimal(y)) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => x.cmp(y),
            },
            Some(FieldType::DateTime) => match (parse_datetime(x), parse_datetime(y)) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => x.cmp(y),
            },
            _ => x.cmp(y),
        },
        (Value::Object(_), Value::Object(_)) => {
            RecordId::from_value(a).cmp(&RecordId::from_value(b))
        }
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn sort_mappings(mut records: Vec<Mapping>, field_spec: &str, field_type: Option<&FieldType>) -> Vec<Mapping> {
    let field = field_spec.strip_prefix('-').unwrap_or(field_spec);
    let descending = field.len() != field_spec.len();
    records.sort_by(|a, b| {
        let ord = compare_values(a.get(field), b.get(field), field_type);
        if descending {
            ord.reverse()
        } else {
            ord
        }
    });
    records
}

impl CacheRoot {
    // ═══════════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════════

    /// Cached records of `model` matching every predicate, ordered by id.
    ///
    /// In economy mode each mapping carries only `id`, unless the lookup pins
    /// a single id (`id` exact).
    ///
    /// # Errors
    ///
    /// - [`CacheSyncError::Predicate`] for malformed lookups, including
    ///   lookups on excluded fields (checked even when nothing is cached)
    /// - [`CacheSyncError::Deserialization`] for a corrupted cached record
    ///   when `ignore_deserialization_errors` is off
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use model_cache_sync::{CacheRoot, Lookups};
    /// # use serde_json::json;
    /// # async fn example(root: &CacheRoot) -> model_cache_sync::SyncResult<()> {
    /// let open = root
    ///     .get("Task", &Lookups::new().is_in("status", json!(["new", "checking"])).build())
    ///     .await?;
    /// let ordered = root.order_by("Task", open, "-price")?;
    /// # Ok(())
    /// # }
    /// ```
    #[tracing::instrument(skip(self, predicates), fields(predicates = predicates.len()))]
    pub async fn get(&self, model: &str, predicates: &[LookupPredicate]) -> SyncResult<Vec<Mapping>> {
        let result = self.get_inner(model, predicates).await;
        metrics::record_crud(model, "get", if result.is_ok() { "success" } else { "error" });
        result
    }

    /// [`get`](Self::get) keyed by record id.
    pub async fn get_map(
        &self,
        model: &str,
        predicates: &[LookupPredicate],
    ) -> SyncResult<BTreeMap<RecordId, Mapping>> {
        Ok(self
            .get(model, predicates)
            .await?
            .into_iter()
            .filter_map(|mapping| RecordId::from_mapping(&mapping).map(|id| (id, mapping)))
            .collect())
    }

    async fn get_inner(&self, model: &str, predicates: &[LookupPredicate]) -> SyncResult<Vec<Mapping>> {
        let registered = self.registered(model)?;
        let catalog = self.registry.snapshot();
        let schema = registered.schema.as_ref();

        let query = CompiledQuery::compile(schema, &catalog, predicates)?;
        for (owner, field) in query.referenced_fields() {
            if catalog
                .exclude_fields(owner)
                .is_some_and(|excluded| excluded.contains(field))
            {
                return Err(PredicateError::ExcludedField {
                    model: owner.to_string(),
                    field: field.to_string(),
                }
                .into());
            }
        }

        let pinned = match predicates {
            [only] => only.pinned_id().map(RecordId),
            _ => None,
        };
        let keys = match pinned {
            Some(id) => vec![self.key(model, id).to_string()],
            None => self
                .cache
                .keys_matching(&CacheKey::model_pattern(&self.config.prefix, model))
                .await
                .map_err(CacheSyncError::CacheUnavailable)?,
        };
        let values = self
            .cache
            .get_many(&keys)
            .await
            .map_err(CacheSyncError::CacheUnavailable)?;

        let mut cached = Vec::with_capacity(values.len());
        for (key, raw) in keys.iter().zip(values) {
            // Expired between SCAN and MGET
            let Some(raw) = raw else { continue };
            match self.read_cached(key, &raw, &registered) {
                Ok(entry) => cached.push(entry),
                Err(e) if self.config.ignore_deserialization_errors => {
                    metrics::record_deserialization_error(model);
                    warn!(model = %model, key = %key, error = %e, "Skipping unreadable cached record");
                }
                Err(e) => {
                    metrics::record_deserialization_error(model);
                    return Err(e.into());
                }
            }
        }

        let related = self
            .related_mappings(&query, &cached)
            .await
            .map_err(CacheSyncError::CacheUnavailable)?;

        let mut found: Vec<(RecordId, Mapping)> = cached
            .into_iter()
            .filter(|(_, mapping)| query.matches(mapping, Some(&related)))
            .collect();
        found.sort_by_key(|(id, _)| *id);

        let economy = self.config.economy_mode && pinned.is_none();
        Ok(found
            .into_iter()
            .map(|(_, mapping)| if economy { id_only(&mapping) } else { mapping })
            .collect())
    }

    /// Parse a cached value and check it against the schema and its key.
    fn read_cached(
        &self,
        key: &str,
        raw: &str,
        registered: &RegisteredModel,
    ) -> Result<(RecordId, Mapping), DeserializationError> {
        let model = registered.name();
        let mapping = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(mapping)) => mapping,
            Ok(other) => {
                return Err(DeserializationError::new(model, ID_FIELD, "a JSON object", format!("got {}", other)))
            }
            Err(e) => return Err(DeserializationError::new(model, ID_FIELD, "a JSON object", e.to_string())),
        };
        let record = deserialize(&mapping, &registered.schema)?;
        match CacheKey::parse(key) {
            Some(parsed) if parsed.id != record.id => Err(DeserializationError::new(
                model,
                ID_FIELD,
                format!("id {} (from key '{}')", parsed.id, key),
                format!("got {}", record.id),
            )),
            _ => Ok((record.id, mapping)),
        }
    }

    /// Stable sort by `field_spec`; a leading `-` sorts descending. Records
    /// comparing equal keep their relative order.
    ///
    /// Without a schema, strings compare lexically; use
    /// [`order_by`](Self::order_by) to sort decimal and timestamp fields by
    /// value.
    #[must_use]
    pub fn order(records: Vec<Mapping>, field_spec: &str) -> Vec<Mapping> {
        sort_mappings(records, field_spec, None)
    }

    /// [`order`](Self::order) using the declared type of the field in
    /// `model`'s schema: decimals by numeric value, timestamps by instant.
    ///
    /// # Errors
    ///
    /// [`CacheSyncError::UnknownModel`] or [`PredicateError::UnknownField`].
    pub fn order_by(&self, model: &str, records: Vec<Mapping>, field_spec: &str) -> SyncResult<Vec<Mapping>> {
        let registered = self.registered(model)?;
        let field = field_spec.strip_prefix('-').unwrap_or(field_spec);
        let def = registered.schema.field(field).ok_or_else(|| PredicateError::UnknownField {
            model: model.to_string(),
            field: field.to_string(),
        })?;
        Ok(sort_mappings(records, field_spec, Some(&def.field_type)))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════════

    /// Insert into the source store, then cache the new record.
    ///
    /// # Errors
    ///
    /// [`CacheSyncError::WriteNotAllowed`] without `write_through`; neither
    /// store is touched in that case.
    #[tracing::instrument(skip(self, fields))]
    pub async fn create(&self, model: &str, fields: Mapping) -> SyncResult<Mapping> {
        let result = self.create_inner(model, fields).await;
        metrics::record_crud(model, "create", if result.is_ok() { "success" } else { "error" });
        result
    }

    async fn create_inner(&self, model: &str, mut fields: Mapping) -> SyncResult<Mapping> {
        let registered = self.writable(model)?;
        let schema = registered.schema.as_ref();
        for def in schema.data_fields() {
            if let Some(default) = &def.default {
                fields.entry(def.name.clone()).or_insert_with(|| default.clone());
            }
        }
        let fields = decode_fields(schema, &fields)?;

        let record = self
            .with_source(model, || self.source.insert(schema, fields))
            .await
            .map_err(CacheSyncError::SourceUnavailable)?;
        debug!(model = %model, id = %record.id, "Inserted into source store");

        let mut written = self
            .write_back(&registered, vec![record], registered.config.cache_ttl())
            .await?;
        written.pop().ok_or_else(|| {
            CacheSyncError::SourceUnavailable(StorageError::Backend("insert returned no record".into()))
        })
    }

    /// Apply `fields` to each record, source first, then re-cache them with
    /// the model TTL.
    pub async fn update(&self, model: &str, ids: &[RecordId], fields: Mapping) -> SyncResult<Vec<Mapping>> {
        self.update_with(model, ids, fields, UpdateOptions::default()).await
    }

    /// [`update`](Self::update) with explicit TTL control.
    #[tracing::instrument(skip(self, fields, options), fields(records = ids.len()))]
    pub async fn update_with(
        &self,
        model: &str,
        ids: &[RecordId],
        fields: Mapping,
        options: UpdateOptions,
    ) -> SyncResult<Vec<Mapping>> {
        let result = self.update_inner(model, ids, fields, options).await;
        metrics::record_crud(model, "update", if result.is_ok() { "success" } else { "error" });
        result
    }

    async fn update_inner(
        &self,
        model: &str,
        ids: &[RecordId],
        fields: Mapping,
        options: UpdateOptions,
    ) -> SyncResult<Vec<Mapping>> {
        let registered = self.writable(model)?;
        let schema = registered.schema.as_ref();
        let fields = decode_fields(schema, &fields)?;

        let ttl = options.ttl.resolve(registered.config.cache_ttl());
        let mut records = Vec::with_capacity(ids.len());
        for &id in ids {
            let changes = fields.clone();
            let result = self
                .with_source(model, || self.source.update_by_id(schema, id, changes))
                .await;
            match result {
                Ok(record) => records.push(record),
                Err(e) => {
                    let error = match e {
                        StorageError::NotFound => CacheSyncError::NotFound {
                            model: model.to_string(),
                            id,
                        },
                        other => CacheSyncError::SourceUnavailable(other),
                    };
                    // Rows before `id` already changed in the source
                    let updated: Vec<RecordId> = records.iter().map(|r| r.id).collect();
                    if !records.is_empty() {
                        if let Err(e) = self.write_back(&registered, records, ttl).await {
                            warn!(model = %model, error = %e, "Could not re-cache records updated before the failure");
                            self.forget(model, &updated).await;
                        }
                    }
                    self.forget(model, &[id]).await;
                    return Err(error);
                }
            }
        }

        self.write_back(&registered, records, ttl).await
    }

    /// Delete each record from the source store, then drop its cache key.
    /// Returns how many records the source store removed.
    #[tracing::instrument(skip(self), fields(records = ids.len()))]
    pub async fn delete(&self, model: &str, ids: &[RecordId]) -> SyncResult<usize> {
        let result = self.delete_inner(model, ids).await;
        metrics::record_crud(model, "delete", if result.is_ok() { "success" } else { "error" });
        result
    }

    async fn delete_inner(&self, model: &str, ids: &[RecordId]) -> SyncResult<usize> {
        let registered = self.writable(model)?;
        let schema = registered.schema.as_ref();

        let mut removed = 0;
        for (done, &id) in ids.iter().enumerate() {
            let existed = match self
                .with_source(model, || self.source.delete_by_id(schema, id))
                .await
            {
                Ok(existed) => existed,
                Err(e) => {
                    // Everything up to and including `id` may be gone from the source
                    self.forget(model, &ids[..=done]).await;
                    return Err(CacheSyncError::SourceUnavailable(e));
                }
            };
            if existed {
                removed += 1;
            }
        }

        let keys: Vec<String> = ids.iter().map(|id| self.key(model, *id).to_string()).collect();
        self.cache
            .delete_many(&keys)
            .await
            .map_err(CacheSyncError::CacheUnavailable)?;
        Ok(removed)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════════════════════

    fn registered(&self, model: &str) -> SyncResult<std::sync::Arc<RegisteredModel>> {
        self.registry
            .get(model)
            .ok_or_else(|| CacheSyncError::UnknownModel(model.to_string()))
    }

    /// Best-effort removal of keys after a failed write; the next pass
    /// restores whatever the source still holds.
    async fn forget(&self, model: &str, ids: &[RecordId]) {
        let keys: Vec<String> = ids.iter().map(|id| self.key(model, *id).to_string()).collect();
        if let Err(e) = self.cache.delete_many(&keys).await {
            warn!(model = %model, keys = keys.len(), error = %e, "Could not drop cache keys after a failed write");
        }
    }

    fn writable(&self, model: &str) -> SyncResult<std::sync::Arc<RegisteredModel>> {
        let registered = self.registered(model)?;
        if !registered.config.write_through {
            return Err(CacheSyncError::WriteNotAllowed {
                model: model.to_string(),
            });
        }
        Ok(registered)
    }

    /// Cache freshly written records. Records no longer satisfying
    /// `filter_by` lose their key instead. Returns the mappings in input
    /// order (ids only in economy mode).
    async fn write_back(
        &self,
        registered: &RegisteredModel,
        records: Vec<Record>,
        ttl: Option<u64>,
    ) -> SyncResult<Vec<Mapping>> {
        let model = registered.name();
        let catalog: Catalog = self.registry.snapshot();
        let prepared = self.prepare(registered, &catalog, &records, false).await?;

        let entries: Vec<(String, String)> = prepared
            .entries
            .iter()
            .map(|(id, mapping)| (self.key(model, *id).to_string(), Value::Object(mapping.clone()).to_string()))
            .collect();
        self.cache
            .set_many(&entries, ttl)
            .await
            .map_err(CacheSyncError::CacheUnavailable)?;

        if !prepared.filtered_out.is_empty() {
            let stale: Vec<String> = prepared
                .filtered_out
                .iter()
                .map(|id| self.key(model, *id).to_string())
                .collect();
            self.cache
                .delete_many(&stale)
                .await
                .map_err(CacheSyncError::CacheUnavailable)?;
        }

        let mut by_id: BTreeMap<RecordId, Mapping> = prepared.entries.into_iter().collect();
        let economy = self.config.economy_mode;
        Ok(records
            .iter()
            .map(|record| match by_id.remove(&record.id) {
                Some(mapping) if !economy => mapping,
                _ => {
                    let mut mapping = Mapping::new();
                    mapping.insert(ID_FIELD.to_string(), Value::from(record.id.0));
                    mapping
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping(value: Value) -> Mapping {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn ids(records: &[Mapping]) -> Vec<i64> {
        records.iter().filter_map(|m| m["id"].as_i64()).collect()
    }

    #[test]
    fn test_order_ascending_and_descending() {
        let records = vec![
            mapping(json!({"id": 1, "points": 10})),
            mapping(json!({"id": 2, "points": 9})),
            mapping(json!({"id": 3, "points": 100})),
        ];
        assert_eq!(ids(&CacheRoot::order(records.clone(), "points")), vec![2, 1, 3]);
        assert_eq!(ids(&CacheRoot::order(records, "-points")), vec![3, 1, 2]);
    }

    #[test]
    fn test_order_text_is_lexical() {
        let records = vec![
            mapping(json!({"id": 1, "code": "10"})),
            mapping(json!({"id": 2, "code": "9"})),
            mapping(json!({"id": 3, "code": "1a"})),
        ];
        // Numeric-looking text still sorts as text, whatever the neighbours look like
        assert_eq!(ids(&CacheRoot::order(records.clone(), "code")), vec![1, 3, 2]);
        assert_eq!(ids(&sort_mappings(records, "code", Some(&FieldType::Text))), vec![1, 3, 2]);
    }

    #[test]
    fn test_order_decimals_by_value() {
        let records = vec![
            mapping(json!({"id": 1, "price": "10.5"})),
            mapping(json!({"id": 2, "price": "9.75"})),
            mapping(json!({"id": 3, "price": "100"})),
        ];
        let decimal = Some(&FieldType::Decimal);
        assert_eq!(ids(&sort_mappings(records.clone(), "price", decimal)), vec![2, 1, 3]);
        assert_eq!(ids(&sort_mappings(records.clone(), "-price", decimal)), vec![3, 1, 2]);
        assert_eq!(ids(&CacheRoot::order(records, "price")), vec![1, 3, 2]);
    }

    #[test]
    fn test_order_is_stable() {
        let records = vec![
            mapping(json!({"id": 1, "status": "b"})),
            mapping(json!({"id": 2, "status": "a"})),
            mapping(json!({"id": 3, "status": "b"})),
            mapping(json!({"id": 4, "status": "a"})),
        ];
        assert_eq!(ids(&CacheRoot::order(records.clone(), "status")), vec![2, 4, 1, 3]);
        assert_eq!(ids(&CacheRoot::order(records, "-status")), vec![1, 3, 2, 4]);
    }

    #[test]
    fn test_order_timestamps_by_instant() {
        let records = vec![
            mapping(json!({"id": 1, "created": "2024-05-01T12:00:00Z"})),
            mapping(json!({"id": 2, "created": "2024-05-01T12:00:00.500Z"})),
            mapping(json!({"id": 3, "created": null})),
        ];
        assert_eq!(ids(&sort_mappings(records, "created", Some(&FieldType::DateTime))), vec![3, 1, 2]);
    }

    #[test]
    fn test_order_nested_by_id() {
        let records = vec![
            mapping(json!({"id": 1, "owner": {"id": 9}})),
            mapping(json!({"id": 2, "owner": {"id": 3}})),
        ];
        assert_eq!(ids(&CacheRoot::order(records, "owner")), vec![2, 1]);
    }

    #[test]
    fn test_id_only() {
        let full = mapping(json!({"id": 4, "status": "new"}));
        assert_eq!(Value::Object(id_only(&full)), json!({"id": 4}));
    }
}
