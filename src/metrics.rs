// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the cache-sync engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `cache_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `model`: registered model name
//! - `outcome`: synced, not_due, busy, failed
//! - `operation`: get, create, update, delete
//! - `status`: success, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record the outcome of one model's reconciliation pass
pub fn record_pass(model: &str, outcome: &str) {
    counter!(
        "cache_sync_passes_total",
        "model" => model.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record how long a full pass took
pub fn record_pass_duration(model: &str, duration: Duration) {
    histogram!(
        "cache_sync_pass_seconds",
        "model" => model.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record the records a pass wrote, removed and skipped
pub fn record_pass_records(model: &str, upserted: usize, deleted: usize, skipped: usize) {
    counter!("cache_sync_records_upserted_total", "model" => model.to_string())
        .increment(upserted as u64);
    counter!("cache_sync_records_deleted_total", "model" => model.to_string())
        .increment(deleted as u64);
    counter!("cache_sync_records_skipped_total", "model" => model.to_string())
        .increment(skipped as u64);
}

/// Record source-store query latency
pub fn record_source_latency(model: &str, duration: Duration) {
    histogram!(
        "cache_sync_source_query_seconds",
        "model" => model.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a source-store call that hit the timeout
pub fn record_source_timeout(model: &str) {
    counter!(
        "cache_sync_source_timeouts_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Set the number of source-store queries currently holding a permit
pub fn set_source_in_flight(count: usize) {
    gauge!("cache_sync_source_in_flight").set(count as f64);
}

/// Record a CRUD call
pub fn record_crud(model: &str, operation: &str, status: &str) {
    counter!(
        "cache_sync_crud_operations_total",
        "model" => model.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a record that failed to (de)serialize
pub fn record_deserialization_error(model: &str) {
    counter!(
        "cache_sync_deserialization_errors_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Timer guard for measuring a pass
pub struct PassTimer {
    model: String,
    start: Instant,
}

impl PassTimer {
    #[must_use]
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            start: Instant::now(),
        }
    }
}

impl Drop for PassTimer {
    fn drop(&mut self) {
        record_pass_duration(&self.model, self.start.elapsed());
    }
}
