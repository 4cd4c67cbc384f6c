// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registered models and their cache configuration.
//!
//! One [`Registry`] per cache root. Registration validates the schema, the
//! excluded fields and the `filter_by` lookups up front, so a bad config fails
//! at startup rather than on the first reconciliation pass.
//!
//! # Example
//!
//! ```
//! use model_cache_sync::registry::Registry;
//! use model_cache_sync::schema::{FieldDef, FieldType, ModelSchema};
//! use model_cache_sync::ModelCacheConfig;
//! use serde_json::json;
//!
//! let registry = Registry::new();
//! registry.register(
//!     ModelSchema::new("User").with_field(FieldDef::new("name", FieldType::Text)),
//!     ModelCacheConfig::default(),
//! ).unwrap();
//! registry.register(
//!     ModelSchema::new("Task")
//!         .with_field(FieldDef::new("status", FieldType::Text))
//!         .with_field(FieldDef::new("owner", FieldType::ForeignKey("User".into()))),
//!     ModelCacheConfig::enabled(300).with_filter("owner__name", json!("Ann")),
//! ).unwrap();
//!
//! assert!(registry.config_for("Task").unwrap().enabled);
//! assert!(registry.config_for("Nope").is_none());
//! ```
//!
//! # Design
//!
//! - **Snapshots**: passes read an immutable [`Catalog`] taken when they
//!   start, so re-registration mid-run takes effect on the next pass.
//! - **Related schemas**: a model referenced by a one-hop filter must already
//!   be registered. Registering it with `enabled: false` declares its schema
//!   without caching it.
//! - **Thread-safe**: `parking_lot::RwLock` around the catalog and the sync stamps.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::config::ModelCacheConfig;
use crate::error::{CacheSyncError, SyncResult};
use crate::query::lookup::LookupPredicate;
use crate::query::matcher::{CompiledQuery, SchemaLookup};
use crate::schema::{ModelSchema, ID_FIELD};
use crate::serializer::ModelCatalog;

/// A model as registered: schema, config and parsed `filter_by`.
#[derive(Debug, Clone)]
pub struct RegisteredModel {
    pub schema: Arc<ModelSchema>,
    pub config: ModelCacheConfig,
    /// `config.filter_by`, parsed
    pub filter: Vec<LookupPredicate>,
}

impl RegisteredModel {
    #[must_use]
    pub fn name(&self) -> &str {
        self.schema.name()
    }
}

/// Immutable view of every registered model.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    models: HashMap<String, Arc<RegisteredModel>>,
}

impl Catalog {
    #[must_use]
    pub fn get(&self, model: &str) -> Option<&Arc<RegisteredModel>> {
        self.models.get(model)
    }

    /// Registered models, sorted by name.
    #[must_use]
    pub fn models(&self) -> Vec<Arc<RegisteredModel>> {
        let mut models: Vec<_> = self.models.values().cloned().collect();
        models.sort_by(|a, b| a.name().cmp(b.name()));
        models
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl SchemaLookup for Catalog {
    fn schema(&self, model: &str) -> Option<&ModelSchema> {
        self.models.get(model).map(|m| m.schema.as_ref())
    }
}

impl ModelCatalog for Catalog {
    fn exclude_fields(&self, model: &str) -> Option<&BTreeSet<String>> {
        self.models.get(model).map(|m| &m.config.exclude_fields)
    }
}

/// When a model last completed a pass.
#[derive(Debug, Clone, Copy)]
pub struct SyncStamp {
    pub at: DateTime<Utc>,
    pub(crate) instant: Instant,
}

impl SyncStamp {
    pub(crate) fn now() -> Self {
        Self {
            at: Utc::now(),
            instant: Instant::now(),
        }
    }
}

/// Per-root model registry.
#[derive(Debug, Default)]
pub struct Registry {
    catalog: RwLock<Catalog>,
    synced: RwLock<HashMap<String, SyncStamp>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a model.
    ///
    /// Replacing a registration clears its last sync time, so the new config
    /// is applied on the next tick.
    pub fn register(&self, schema: ModelSchema, config: ModelCacheConfig) -> SyncResult<()> {
        let name = schema.name().to_string();
        schema
            .validate()
            .map_err(|reason| CacheSyncError::configuration(&name, reason))?;

        for field in &config.exclude_fields {
            if field == ID_FIELD {
                return Err(CacheSyncError::configuration(
                    &name,
                    "the primary key cannot be excluded",
                ));
            }
            if !schema.has_field(field) {
                return Err(CacheSyncError::configuration(
                    &name,
                    format!("excluded field '{}' is not a field of the model", field),
                ));
            }
        }

        let filter = LookupPredicate::parse_all(
            config.filter_by.iter().map(|(k, v)| (k.as_str(), v.clone())),
        )
        .map_err(|e| CacheSyncError::configuration(&name, format!("filter_by: {}", e)))?;

        let mut catalog = self.catalog.write();
        let mut candidate = catalog.clone();
        let entry = Arc::new(RegisteredModel {
            schema: Arc::new(schema),
            config,
            filter,
        });
        candidate.models.insert(name.clone(), Arc::clone(&entry));

        CompiledQuery::compile(&entry.schema, &candidate, &entry.filter)
            .map_err(|e| CacheSyncError::configuration(&name, format!("filter_by: {}", e)))?;

        *catalog = candidate;
        drop(catalog);
        self.synced.write().remove(&name);

        tracing::info!(
            model = %name,
            enabled = entry.config.enabled,
            ttl_secs = entry.config.ttl_secs,
            filters = entry.filter.len(),
            "Registered model"
        );
        Ok(())
    }

    #[must_use]
    pub fn get(&self, model: &str) -> Option<Arc<RegisteredModel>> {
        self.catalog.read().get(model).cloned()
    }

    #[must_use]
    pub fn config_for(&self, model: &str) -> Option<ModelCacheConfig> {
        self.catalog.read().get(model).map(|m| m.config.clone())
    }

    /// Current catalog. Later registrations do not affect the returned value.
    #[must_use]
    pub fn snapshot(&self) -> Catalog {
        self.catalog.read().clone()
    }

    #[must_use]
    pub fn last_synced(&self, model: &str) -> Option<SyncStamp> {
        self.synced.read().get(model).copied()
    }

    pub(crate) fn mark_synced(&self, model: &str, stamp: SyncStamp) {
        self.synced.write().insert(model.to_string(), stamp);
    }
}
