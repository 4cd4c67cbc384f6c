// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for cache roots and cached models.
//!
//! # Example
//!
//! ```
//! use model_cache_sync::{ModelCacheConfig, RootConfig};
//! use serde_json::json;
//!
//! // Minimal root config (uses defaults)
//! let root = RootConfig::default();
//! assert_eq!(root.prefix, "redis_test");
//! assert_eq!(root.concurrency_limit, 50);
//!
//! // Per-model settings
//! let tasks = ModelCacheConfig {
//!     enabled: true,
//!     ttl_secs: 5 * 60,
//!     save_related_models: false,
//!     ..Default::default()
//! }
//! .with_filter("status", json!("in_work"))
//! .excluding(["notes"]);
//!
//! assert_eq!(tasks.filter_by.len(), 1);
//! assert!(tasks.exclude_fields.contains("notes"));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

/// Root-level settings shared by every model cached under one prefix.
#[derive(Debug, Clone, Deserialize)]
pub struct RootConfig {
    /// Namespace for all keys (`{prefix}:{model}:{id}`)
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Maximum number of source-store queries in flight across all models
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    /// Skip (and log) records that fail to deserialize instead of failing
    #[serde(default = "default_ignore_deserialization_errors")]
    pub ignore_deserialization_errors: bool,

    /// Return only ids from reads and writes, except single-id lookups
    #[serde(default)]
    pub economy_mode: bool,

    /// Upper bound for a single source-store call
    #[serde(default = "default_source_timeout_ms")]
    pub source_timeout_ms: u64,
}

fn default_prefix() -> String { "redis_test".to_string() }
fn default_concurrency_limit() -> usize { 50 }
fn default_ignore_deserialization_errors() -> bool { true }
fn default_source_timeout_ms() -> u64 { 30_000 }

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            concurrency_limit: default_concurrency_limit(),
            ignore_deserialization_errors: default_ignore_deserialization_errors(),
            economy_mode: false,
            source_timeout_ms: default_source_timeout_ms(),
        }
    }
}

impl RootConfig {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }
}

/// Per-model cache settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelCacheConfig {
    /// Whether the scheduler refreshes this model
    #[serde(default)]
    pub enabled: bool,

    /// Refresh interval and cache TTL in seconds (0 = refresh every tick, no expiry)
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Inline related records one level deep instead of bare ids
    #[serde(default = "default_save_related_models")]
    pub save_related_models: bool,

    /// Fields never written to the cache
    #[serde(default)]
    pub exclude_fields: BTreeSet<String>,

    /// Lookups every cached record must satisfy (`"status__in" => ["a", "b"]`)
    #[serde(default)]
    pub filter_by: BTreeMap<String, Value>,

    /// Propagate source-side deletions and filter exclusions into the cache
    #[serde(default)]
    pub allow_delete: bool,

    /// Let CRUD writes go to the source store first
    #[serde(default)]
    pub write_through: bool,
}

fn default_ttl_secs() -> u64 { 60 * 5 }
fn default_save_related_models() -> bool { true }

impl Default for ModelCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: default_ttl_secs(),
            save_related_models: default_save_related_models(),
            exclude_fields: BTreeSet::new(),
            filter_by: BTreeMap::new(),
            allow_delete: false,
            write_through: false,
        }
    }
}

impl ModelCacheConfig {
    /// Enabled model with the given TTL, everything else default.
    #[must_use]
    pub fn enabled(ttl_secs: u64) -> Self {
        Self {
            enabled: true,
            ttl_secs,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_filter(mut self, lookup: impl Into<String>, value: Value) -> Self {
        self.filter_by.insert(lookup.into(), value);
        self
    }

    #[must_use]
    pub fn excluding<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    /// TTL passed to the cache store; `None` means no expiry.
    #[must_use]
    pub fn cache_ttl(&self) -> Option<u64> {
        (self.ttl_secs > 0).then_some(self.ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_root_defaults() {
        let config = RootConfig::default();
        assert_eq!(config.prefix, "redis_test");
        assert_eq!(config.concurrency_limit, 50);
        assert!(config.ignore_deserialization_errors);
        assert!(!config.economy_mode);
        assert_eq!(config.source_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_root_deserialize_partial() {
        let config: RootConfig = serde_json::from_value(json!({
            "prefix": "test_caching",
            "economy_mode": true
        }))
        .unwrap();
        assert_eq!(config.prefix, "test_caching");
        assert!(config.economy_mode);
        assert_eq!(config.concurrency_limit, 50);
    }

    #[test]
    fn test_model_defaults() {
        let config = ModelCacheConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.ttl_secs, 300);
        assert!(config.save_related_models);
        assert!(!config.allow_delete);
        assert!(!config.write_through);
    }

    #[test]
    fn test_model_deserialize() {
        let config: ModelCacheConfig = serde_json::from_value(json!({
            "enabled": true,
            "ttl_secs": 900,
            "exclude_fields": ["password", "email"],
            "filter_by": {"status__in": ["new", "in_work"]},
            "write_through": true
        }))
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.ttl_secs, 900);
        assert_eq!(config.exclude_fields.len(), 2);
        assert_eq!(config.filter_by["status__in"], json!(["new", "in_work"]));
        assert!(config.write_through);
    }

    #[test]
    fn test_negative_ttl_is_rejected_by_type() {
        let result: Result<ModelCacheConfig, _> = serde_json::from_value(json!({"ttl_secs": -1}));
        assert!(result.is_err());
    }

    #[test]
    fn test_cache_ttl_zero_means_no_expiry() {
        assert_eq!(ModelCacheConfig::enabled(0).cache_ttl(), None);
        assert_eq!(ModelCacheConfig::enabled(60).cache_ttl(), Some(60));
    }
}
