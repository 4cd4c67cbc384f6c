// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation: one fetch-filter-serialize-diff-apply pass per model.
//!
//! ```text
//! run_one_tick()
//!   ├── snapshot registry
//!   └── per enabled model (JoinSet task)
//!         DueCheck   last successful pass older than ttl_secs?
//!         Fetching   source.query(filter_by)        ← source gate + timeout
//!         Diffing    serialize, re-check filter, keys_matching({prefix}:{model}:*)
//!         Applying   set_many(ttl) then, with allow_delete, delete stale keys
//! ```
//!
//! A failed pass leaves the model's keys as the last successful pass wrote
//! them and does not advance its sync stamp, so the next tick retries it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{CacheSyncError, SyncResult};
use crate::key::CacheKey;
use crate::metrics::{self, PassTimer};
use crate::query::matcher::CompiledQuery;
use crate::record::{Mapping, Record, RecordId};
use crate::registry::{Catalog, RegisteredModel, SyncStamp};
use crate::serializer::{match_view, project};

use super::{CacheRoot, PassOutcome, PassPhase, PassStats, PhaseGuard};

/// Records of one model ready for the cache.
pub(super) struct Prepared {
    /// Matching records and their cached mappings
    pub(super) entries: Vec<(RecordId, Mapping)>,
    /// Records that no longer satisfy `filter_by`
    pub(super) filtered_out: Vec<RecordId>,
    /// Records that failed to serialize and were skipped
    pub(super) skipped: Vec<RecordId>,
}

impl CacheRoot {
    // ═══════════════════════════════════════════════════════════════════════════
    // Scheduling
    // ═══════════════════════════════════════════════════════════════════════════

    /// Check every enabled model once and refresh the ones that are due.
    ///
    /// Passes for different models run concurrently; their source queries
    /// share the root's concurrency limit. A model whose previous pass is
    /// still running reports [`PassOutcome::Busy`].
    ///
    /// Dropping the returned future aborts the passes still in flight.
    #[tracing::instrument(skip(self), fields(prefix = %self.config.prefix))]
    pub async fn run_one_tick(self: &Arc<Self>) -> super::TickReport {
        let catalog = Arc::new(self.registry.snapshot());
        let mut passes = JoinSet::new();

        for model in catalog.models() {
            if !model.config.enabled {
                continue;
            }
            let root = Arc::clone(self);
            let catalog = Arc::clone(&catalog);
            passes.spawn(async move {
                let outcome = root.run_pass(&model, &catalog).await;
                (model.name().to_string(), outcome)
            });
        }

        let mut report = super::TickReport::default();
        while let Some(joined) = passes.join_next().await {
            match joined {
                Ok((model, outcome)) => {
                    metrics::record_pass(&model, outcome.label());
                    report.outcomes.insert(model, outcome);
                }
                Err(e) => error!(error = %e, "Reconciliation task panicked"),
            }
        }
        report
    }

    async fn run_pass(&self, model: &Arc<RegisteredModel>, catalog: &Catalog) -> PassOutcome {
        let name = model.name();
        let Some(guard) = self.claim_pass(name) else {
            debug!(model = %name, "Previous pass still running");
            return PassOutcome::Busy;
        };

        if !self.is_due(model) {
            return PassOutcome::NotDue;
        }

        let _timer = PassTimer::new(name);
        let stamp = SyncStamp::now();
        match self.reconcile(model, catalog, &guard).await {
            Ok(stats) => {
                // A re-registration during the pass must still refresh next tick
                if self
                    .registry
                    .get(name)
                    .is_some_and(|current| Arc::ptr_eq(&current, model))
                {
                    self.registry.mark_synced(name, stamp);
                }
                metrics::record_pass_records(name, stats.upserted, stats.deleted, stats.skipped);
                info!(
                    model = %name,
                    fetched = stats.fetched,
                    upserted = stats.upserted,
                    deleted = stats.deleted,
                    skipped = stats.skipped,
                    "Reconciliation pass complete"
                );
                PassOutcome::Synced(stats)
            }
            Err(e) => {
                warn!(model = %name, kind = e.kind(), error = %e, "Reconciliation pass failed");
                PassOutcome::Failed {
                    kind: e.kind(),
                    error: e.to_string(),
                }
            }
        }
    }

    fn is_due(&self, model: &RegisteredModel) -> bool {
        match self.registry.last_synced(model.name()) {
            None => true,
            Some(_) if model.config.ttl_secs == 0 => true,
            Some(stamp) => stamp.instant.elapsed() >= Duration::from_secs(model.config.ttl_secs),
        }
    }

    async fn reconcile(
        &self,
        model: &RegisteredModel,
        catalog: &Catalog,
        guard: &PhaseGuard<'_>,
    ) -> SyncResult<PassStats> {
        let name = model.name();
        let schema = model.schema.as_ref();

        guard.set(PassPhase::Fetching);
        let records = self
            .with_source(name, || self.source.query(schema, &model.filter))
            .await
            .map_err(CacheSyncError::SourceUnavailable)?;
        debug!(model = %name, fetched = records.len(), "Fetched source records");

        guard.set(PassPhase::Diffing);
        let prepared = self
            .prepare(model, catalog, &records, self.config.ignore_deserialization_errors)
            .await?;

        let existing = self
            .cache
            .keys_matching(&CacheKey::model_pattern(&self.config.prefix, name))
            .await
            .map_err(CacheSyncError::CacheUnavailable)?;

        // Skipped records keep whatever the cache already holds for them
        let keep: HashSet<String> = prepared
            .entries
            .iter()
            .map(|(id, _)| *id)
            .chain(prepared.skipped.iter().copied())
            .map(|id| self.key(name, id).to_string())
            .collect();
        let entries: Vec<(String, String)> = prepared
            .entries
            .into_iter()
            .map(|(id, mapping)| (self.key(name, id).to_string(), Value::Object(mapping).to_string()))
            .collect();

        guard.set(PassPhase::Applying);
        let written = self
            .cache
            .set_many(&entries, model.config.cache_ttl())
            .await
            .map_err(CacheSyncError::CacheUnavailable)?
            .written;

        let mut deleted = 0;
        if model.config.allow_delete {
            let stale: Vec<String> = existing.into_iter().filter(|k| !keep.contains(k)).collect();
            if !stale.is_empty() {
                debug!(model = %name, stale = stale.len(), "Removing stale keys");
                deleted = self
                    .cache
                    .delete_many(&stale)
                    .await
                    .map_err(CacheSyncError::CacheUnavailable)?;
            }
        }

        Ok(PassStats {
            fetched: records.len(),
            upserted: written,
            deleted,
            skipped: prepared.skipped.len(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Shared with CRUD writes
    // ═══════════════════════════════════════════════════════════════════════════

    /// Serialize `records`, keep the ones satisfying `filter_by` and project
    /// them to their cached form.
    ///
    /// With `skip_errors` a record that fails to serialize is logged and
    /// skipped; otherwise the first failure is returned.
    pub(super) async fn prepare(
        &self,
        model: &RegisteredModel,
        catalog: &Catalog,
        records: &[Record],
        skip_errors: bool,
    ) -> SyncResult<Prepared> {
        let name = model.name();
        let schema = model.schema.as_ref();
        let filter = CompiledQuery::compile(schema, catalog, &model.filter)?;

        let mut views = Vec::with_capacity(records.len());
        let mut skipped = Vec::new();
        for record in records {
            match match_view(record, schema, catalog) {
                Ok(view) => views.push((record.id, view)),
                Err(e) => {
                    metrics::record_deserialization_error(name);
                    if !skip_errors {
                        return Err(e.into());
                    }
                    warn!(model = %name, id = %record.id, error = %e, "Skipping record that failed to serialize");
                    skipped.push(record.id);
                }
            }
        }

        let related = self
            .related_mappings(&filter, &views)
            .await
            .map_err(CacheSyncError::CacheUnavailable)?;

        let mut entries = Vec::with_capacity(views.len());
        let mut filtered_out = Vec::new();
        for (id, view) in views {
            if filter.matches(&view, Some(&related)) {
                entries.push((id, project(view, schema, &model.config, catalog)));
            } else {
                filtered_out.push(id);
            }
        }
        if !filtered_out.is_empty() {
            debug!(model = %name, excluded = filtered_out.len(), "Records excluded by filter_by");
        }

        Ok(Prepared {
            entries,
            filtered_out,
            skipped,
        })
    }
}
