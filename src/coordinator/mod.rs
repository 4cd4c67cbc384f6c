// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache root coordinator.
//!
//! A [`CacheRoot`] owns one key prefix, its model [`Registry`] and handles to
//! both stores. It exposes two surfaces:
//! - **Reconciliation**: [`CacheRoot::run_one_tick`] refreshes every enabled
//!   model that is due (see `reconcile.rs`)
//! - **CRUD**: cache-first reads and write-through writes (see `crud.rs`)
//!
//! # Source Gate
//!
//! Every source-store call, from passes and CRUD alike, goes through one
//! `tokio::sync::Semaphore` sized to `concurrency_limit`. Tokio semaphores are
//! fair, so queued callers are served in FIFO order. Each call is also bounded
//! by `source_timeout_ms`.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use model_cache_sync::{CacheRoot, ModelCacheConfig, RootConfig};
//! use model_cache_sync::schema::{FieldDef, FieldType, ModelSchema};
//! use model_cache_sync::storage::memory::{InMemoryCacheStore, InMemorySourceStore};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let root = Arc::new(CacheRoot::new(
//!     RootConfig::with_prefix("app"),
//!     Arc::new(InMemoryCacheStore::new()),
//!     Arc::new(InMemorySourceStore::new()),
//! ).unwrap());
//!
//! root.register(
//!     ModelSchema::new("Task").with_field(FieldDef::new("status", FieldType::Text)),
//!     ModelCacheConfig::enabled(300),
//! ).unwrap();
//!
//! // The host drives the schedule
//! let report = root.run_one_tick().await;
//! assert!(report.failed().next().is_none());
//! # }
//! ```

mod crud;
mod reconcile;
mod types;

pub use types::{PassOutcome, PassPhase, PassStats, TickReport, TtlPolicy, UpdateOptions};

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::config::{ModelCacheConfig, RootConfig};
use crate::error::{CacheSyncError, SyncResult};
use crate::key::CacheKey;
use crate::query::matcher::{CompiledQuery, RelatedMappings};
use crate::record::{Mapping, RecordId};
use crate::registry::Registry;
use crate::schema::{ModelSchema, RESERVED_KEY_CHARS};
use crate::storage::traits::{CacheStore, SourceStore, StorageError};

/// One cache namespace: prefix, registered models and store handles.
///
/// # Thread Safety
///
/// `Send + Sync`. Reconciliation needs an `Arc<CacheRoot>` because each
/// model's pass runs as its own task; CRUD works on `&self`.
pub struct CacheRoot {
    pub(super) config: RootConfig,
    pub(super) registry: Registry,
    pub(super) cache: Arc<dyn CacheStore>,
    pub(super) source: Arc<dyn SourceStore>,

    /// Admission gate for source-store calls
    pub(super) source_gate: Semaphore,

    /// Source calls currently holding a permit
    pub(super) source_in_flight: AtomicUsize,

    /// Models with a pass in progress; absent means Idle
    pub(super) phases: DashMap<String, PassPhase>,
}

impl CacheRoot {
    /// Create a root. Fails if the prefix cannot be used in keys or the
    /// concurrency limit is zero.
    pub fn new(
        config: RootConfig,
        cache: Arc<dyn CacheStore>,
        source: Arc<dyn SourceStore>,
    ) -> SyncResult<Self> {
        if config.prefix.is_empty() || config.prefix.contains(RESERVED_KEY_CHARS) {
            return Err(CacheSyncError::configuration(
                &config.prefix,
                "prefix must be non-empty and may not contain ':' or glob characters",
            ));
        }
        if config.concurrency_limit == 0 {
            return Err(CacheSyncError::configuration(
                &config.prefix,
                "concurrency_limit must be at least 1",
            ));
        }

        Ok(Self {
            source_gate: Semaphore::new(config.concurrency_limit),
            source_in_flight: AtomicUsize::new(0),
            phases: DashMap::new(),
            registry: Registry::new(),
            config,
            cache,
            source,
        })
    }

    #[must_use]
    pub fn config(&self) -> &RootConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Register (or replace) a model. See [`Registry::register`].
    pub fn register(&self, schema: ModelSchema, config: ModelCacheConfig) -> SyncResult<()> {
        self.registry.register(schema, config)
    }

    #[must_use]
    pub fn config_for(&self, model: &str) -> Option<ModelCacheConfig> {
        self.registry.config_for(model)
    }

    /// Current pass phase of `model`.
    #[must_use]
    pub fn model_phase(&self, model: &str) -> PassPhase {
        self.phases.get(model).map(|p| *p).unwrap_or_default()
    }

    /// Cache key of one record under this root.
    #[must_use]
    pub fn key(&self, model: &str, id: RecordId) -> CacheKey {
        CacheKey::new(&self.config.prefix, model, id)
    }

    /// Run `op` against the source store once a permit is available,
    /// bounded by the source timeout.
    pub(super) async fn with_source<T, F, Fut>(&self, model: &str, op: F) -> Result<T, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let _permit = self
            .source_gate
            .acquire()
            .await
            .map_err(|_| StorageError::Backend("source gate closed".into()))?;

        let in_flight = InFlightGuard::enter(&self.source_in_flight);
        let start = Instant::now();

        let limit = self.config.source_timeout();
        let result = timeout(limit, op()).await;

        drop(in_flight);
        crate::metrics::record_source_latency(model, start.elapsed());

        match result {
            Ok(result) => result,
            Err(_) => {
                crate::metrics::record_source_timeout(model);
                Err(StorageError::Timeout(limit.as_millis() as u64))
            }
        }
    }

    /// Mark `model` as mid-pass. `None` if a pass is already running.
    pub(super) fn claim_pass(&self, model: &str) -> Option<PhaseGuard<'_>> {
        match self.phases.entry(model.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(PassPhase::DueCheck);
                Some(PhaseGuard {
                    phases: &self.phases,
                    model: model.to_string(),
                })
            }
        }
    }

    /// Fetch cached related records referenced by id from one-hop predicates.
    ///
    /// Relations already expanded in the mappings need no lookup.
    pub(super) async fn related_mappings(
        &self,
        query: &CompiledQuery,
        mappings: &[(RecordId, Mapping)],
    ) -> Result<RelatedMappings, StorageError> {
        let mut wanted: BTreeSet<(String, RecordId)> = BTreeSet::new();
        for (field, related_model) in query.hops() {
            for (_, mapping) in mappings {
                if let Some(id) = mapping
                    .get(field)
                    .filter(|v| v.is_number())
                    .and_then(RecordId::from_value)
                {
                    wanted.insert((related_model.to_string(), id));
                }
            }
        }
        if wanted.is_empty() {
            return Ok(RelatedMappings::new());
        }

        let keys: Vec<String> = wanted
            .iter()
            .map(|(model, id)| self.key(model, *id).to_string())
            .collect();
        let values = self.cache.get_many(&keys).await?;

        let mut related = RelatedMappings::new();
        for ((model, id), raw) in wanted.into_iter().zip(values) {
            match raw.map(|raw| serde_json::from_str::<Value>(&raw)) {
                Some(Ok(Value::Object(mapping))) => {
                    related.insert((model, id), mapping);
                }
                Some(_) => debug!(related = %model, id = %id, "Unreadable related record in cache"),
                None => {}
            }
        }
        Ok(related)
    }
}

/// Tracks the phase of a claimed pass; resets the model to Idle on drop,
/// including when the pass task is aborted.
pub(super) struct PhaseGuard<'a> {
    phases: &'a DashMap<String, PassPhase>,
    model: String,
}

impl PhaseGuard<'_> {
    pub(super) fn set(&self, phase: PassPhase) {
        self.phases.insert(self.model.clone(), phase);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.phases.remove(&self.model);
    }
}

/// Counts one source call as in flight until dropped, so a caller that is
/// cancelled mid-call still releases its slot in the gauge.
struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::set_source_in_flight(now);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let now = self.counter.fetch_sub(1, Ordering::SeqCst) - 1;
        crate::metrics::set_source_in_flight(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{InMemoryCacheStore, InMemorySourceStore};
    use std::time::Duration;

    fn root(config: RootConfig) -> SyncResult<CacheRoot> {
        CacheRoot::new(
            config,
            Arc::new(InMemoryCacheStore::new()),
            Arc::new(InMemorySourceStore::new()),
        )
    }

    #[test]
    fn test_rejects_bad_prefix() {
        assert!(root(RootConfig::with_prefix("a:b")).is_err());
        assert!(root(RootConfig::with_prefix("")).is_err());
        assert!(root(RootConfig::with_prefix("app*")).is_err());
        assert!(root(RootConfig::with_prefix("test_caching")).is_ok());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let config = RootConfig {
            concurrency_limit: 0,
            ..Default::default()
        };
        assert!(matches!(
            root(config),
            Err(CacheSyncError::Configuration { .. })
        ));
    }

    #[test]
    fn test_phase_guard_resets_to_idle() {
        let root = root(RootConfig::default()).unwrap();
        {
            let guard = root.claim_pass("Task").unwrap();
            assert_eq!(root.model_phase("Task"), PassPhase::DueCheck);
            assert!(root.claim_pass("Task").is_none());
            guard.set(PassPhase::Fetching);
            assert_eq!(root.model_phase("Task"), PassPhase::Fetching);
        }
        assert_eq!(root.model_phase("Task"), PassPhase::Idle);
        assert!(root.claim_pass("Task").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_source_times_out() {
        let config = RootConfig {
            source_timeout_ms: 50,
            ..Default::default()
        };
        let root = root(config).unwrap();

        let result: Result<(), _> = root
            .with_source("Task", || async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(StorageError::Timeout(50))));
        assert_eq!(root.source_in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_source_call_releases_in_flight() {
        let root = root(RootConfig::default()).unwrap();
        let started = Arc::new(tokio::sync::Notify::new());

        {
            let call = root.with_source("Task", || {
                let started = started.clone();
                async move {
                    started.notify_one();
                    std::future::pending::<Result<(), StorageError>>().await
                }
            });
            tokio::pin!(call);
            tokio::select! {
                _ = &mut call => panic!("pending call completed"),
                _ = started.notified() => {}
            }
            assert_eq!(root.source_in_flight.load(Ordering::SeqCst), 1);
        }

        // The call future was dropped mid-await
        assert_eq!(root.source_in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(root.source_gate.available_permits(), root.config.concurrency_limit);
    }
}
