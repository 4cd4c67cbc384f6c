//! Reconciliation pass tests against the in-memory stores.
//!
//! The source store is wrapped in [`InstrumentedSource`], which counts
//! queries, tracks how many run at once and can fail, stall or gate them.
//!
//! # Running
//! ```bash
//! cargo test --test reconcile
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::Notify;

use model_cache_sync::query::LookupPredicate;
use model_cache_sync::record::{FieldMap, FieldValue, Record, RecordId, RelatedRef};
use model_cache_sync::schema::{FieldDef, FieldType, ModelSchema};
use model_cache_sync::storage::memory::{InMemoryCacheStore, InMemorySourceStore};
use model_cache_sync::storage::traits::{CacheStore, SourceStore, StorageError};
use model_cache_sync::{CacheRoot, ModelCacheConfig, PassOutcome, PassPhase, RootConfig};

// =============================================================================
// Instrumented source
// =============================================================================

/// Wraps [`InMemorySourceStore`] with counters and injected behaviour on `query`.
#[derive(Default)]
struct InstrumentedSource {
    inner: InMemorySourceStore,
    queries: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Sleep this long inside every query
    delay: Option<Duration>,
    /// Queries for these models fail
    fail_models: Vec<String>,
    /// Queries wait for a notification before answering
    gate: Option<Arc<Notify>>,
    /// Updates and deletes of these ids fail
    fail_ids: Vec<RecordId>,
}

impl InstrumentedSource {
    fn new() -> Self {
        Self::default()
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn failing(mut self, model: &str) -> Self {
        self.fail_models.push(model.to_string());
        self
    }

    fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn failing_id(mut self, id: i64) -> Self {
        self.fail_ids.push(RecordId(id));
        self
    }

    fn check_writable(&self, id: RecordId) -> Result<(), StorageError> {
        if self.fail_ids.contains(&id) {
            return Err(StorageError::Backend("lock wait timeout".into()));
        }
        Ok(())
    }

    fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceStore for InstrumentedSource {
    async fn query(
        &self,
        schema: &ModelSchema,
        predicates: &[LookupPredicate],
    ) -> Result<Vec<Record>, StorageError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = if self.fail_models.iter().any(|m| m == schema.name()) {
            Err(StorageError::Backend("connection refused".into()))
        } else {
            self.inner.query(schema, predicates).await
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn insert(&self, schema: &ModelSchema, fields: FieldMap) -> Result<Record, StorageError> {
        self.inner.insert(schema, fields).await
    }

    async fn update_by_id(
        &self,
        schema: &ModelSchema,
        id: RecordId,
        fields: FieldMap,
    ) -> Result<Record, StorageError> {
        self.check_writable(id)?;
        self.inner.update_by_id(schema, id, fields).await
    }

    async fn delete_by_id(&self, schema: &ModelSchema, id: RecordId) -> Result<bool, StorageError> {
        self.check_writable(id)?;
        self.inner.delete_by_id(schema, id).await
    }
}

// =============================================================================
// Fixtures
// =============================================================================

const PREFIX: &str = "sync";

fn task_schema() -> ModelSchema {
    ModelSchema::new("Task")
        .with_field(FieldDef::new("status", FieldType::Text))
        .with_field(FieldDef::new("price", FieldType::Decimal))
}

fn task(id: i64, status: &str, price: i64) -> Record {
    Record::new("Task", RecordId(id))
        .with("status", status)
        .with("price", Decimal::from(price))
}

fn root_with(config: RootConfig, source: Arc<InstrumentedSource>) -> (Arc<CacheRoot>, Arc<InMemoryCacheStore>) {
    let cache = Arc::new(InMemoryCacheStore::new());
    let root = CacheRoot::new(config, cache.clone(), source).unwrap();
    (Arc::new(root), cache)
}

fn root(source: Arc<InstrumentedSource>) -> (Arc<CacheRoot>, Arc<InMemoryCacheStore>) {
    root_with(RootConfig::with_prefix(PREFIX), source)
}

async fn cached(cache: &InMemoryCacheStore, model: &str, id: i64) -> Option<Value> {
    let raw = cache.get(&format!("{}:{}:{}", PREFIX, model, id)).await.unwrap()?;
    Some(serde_json::from_str(&raw).unwrap())
}

fn stats(outcome: Option<&PassOutcome>) -> model_cache_sync::PassStats {
    match outcome {
        Some(PassOutcome::Synced(stats)) => *stats,
        other => panic!("expected a synced pass, got {:?}", other),
    }
}

fn failure_kind(outcome: Option<&PassOutcome>) -> &'static str {
    match outcome {
        Some(PassOutcome::Failed { kind, .. }) => kind,
        other => panic!("expected a failed pass, got {:?}", other),
    }
}

// =============================================================================
// Passes
// =============================================================================

#[tokio::test]
async fn test_pass_writes_matching_records_and_propagates_exclusions() {
    let source = Arc::new(InstrumentedSource::new());
    source.inner.put_record(task(1, "new", 10));
    source.inner.put_record(task(2, "done", 20));
    let (root, cache) = root(source.clone());
    root.register(
        task_schema(),
        ModelCacheConfig {
            allow_delete: true,
            ..ModelCacheConfig::enabled(0).with_filter("status", json!("new"))
        },
    )
    .unwrap();

    let report = root.run_one_tick().await;
    let first = stats(report.outcome("Task"));
    assert_eq!((first.fetched, first.upserted, first.deleted), (2, 1, 0));
    assert_eq!(
        cached(&cache, "Task", 1).await,
        Some(json!({"id": 1, "status": "new", "price": "10"}))
    );
    assert!(cached(&cache, "Task", 2).await.is_none());

    // Record 1 leaves the filter, record 3 appears, a stray key lingers
    source.inner.put_record(task(1, "done", 10));
    source.inner.put_record(task(3, "new", 30));
    cache.set("sync:Task:77", "{\"id\":77}", None).await.unwrap();

    let second = stats(root.run_one_tick().await.outcome("Task"));
    assert_eq!((second.upserted, second.deleted), (1, 2));
    assert!(cached(&cache, "Task", 1).await.is_none());
    assert!(cached(&cache, "Task", 77).await.is_none());
    assert!(cached(&cache, "Task", 3).await.is_some());
}

#[tokio::test]
async fn test_pass_without_allow_delete_keeps_stale_keys() {
    let source = Arc::new(InstrumentedSource::new());
    source.inner.put_record(task(1, "new", 1));
    let (root, cache) = root(source.clone());
    root.register(task_schema(), ModelCacheConfig::enabled(0)).unwrap();

    root.run_one_tick().await;
    source.inner.remove_record("Task", RecordId(1));
    let second = stats(root.run_one_tick().await.outcome("Task"));

    assert_eq!(second.deleted, 0);
    assert!(cached(&cache, "Task", 1).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_ttl_gates_passes() {
    let source = Arc::new(InstrumentedSource::new());
    source.inner.put_record(task(1, "new", 1));
    let (root, cache) = root(source.clone());
    root.register(task_schema(), ModelCacheConfig::enabled(60)).unwrap();

    assert!(matches!(root.run_one_tick().await.outcome("Task"), Some(PassOutcome::Synced(_))));
    assert_eq!(cache.ttl("sync:Task:1"), Some(Duration::from_secs(60)));

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(matches!(root.run_one_tick().await.outcome("Task"), Some(PassOutcome::NotDue)));
    assert_eq!(source.queries(), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(matches!(root.run_one_tick().await.outcome("Task"), Some(PassOutcome::Synced(_))));
    assert_eq!(source.queries(), 2);
    assert!(root.registry().last_synced("Task").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_zero_ttl_refreshes_every_tick_without_expiry() {
    let source = Arc::new(InstrumentedSource::new());
    source.inner.put_record(task(1, "new", 1));
    let (root, cache) = root(source.clone());
    root.register(task_schema(), ModelCacheConfig::enabled(0)).unwrap();

    for _ in 0..3 {
        assert!(matches!(root.run_one_tick().await.outcome("Task"), Some(PassOutcome::Synced(_))));
    }
    assert_eq!(source.queries(), 3);
    assert!(cache.ttl("sync:Task:1").is_none());
    assert!(cached(&cache, "Task", 1).await.is_some());
}

#[tokio::test]
async fn test_disabled_models_are_not_scheduled() {
    let source = Arc::new(InstrumentedSource::new());
    source.inner.put_record(task(1, "new", 1));
    let (root, cache) = root(source.clone());
    root.register(task_schema(), ModelCacheConfig::default()).unwrap();

    let report = root.run_one_tick().await;
    assert!(report.outcomes.is_empty());
    assert_eq!(source.queries(), 0);
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_source_queries_respect_concurrency_limit() {
    let source = Arc::new(InstrumentedSource::new().with_delay(Duration::from_millis(50)));
    let (root, _cache) = root_with(
        RootConfig {
            concurrency_limit: 2,
            ..RootConfig::with_prefix(PREFIX)
        },
        source.clone(),
    );
    for i in 0..8 {
        let name = format!("M{}", i);
        source.inner.put_record(Record::new(name.as_str(), RecordId(1)).with("label", "x"));
        root.register(
            ModelSchema::new(name).with_field(FieldDef::new("label", FieldType::Text)),
            ModelCacheConfig::enabled(60),
        )
        .unwrap();
    }

    let report = root.run_one_tick().await;

    assert_eq!(report.synced().count(), 8);
    assert_eq!(source.queries(), 8);
    assert_eq!(source.max_in_flight(), 2);
}

#[tokio::test]
async fn test_serialization_errors_skip_or_abort() {
    for ignore in [true, false] {
        let source = Arc::new(InstrumentedSource::new());
        source.inner.put_record(task(1, "new", 10));
        source.inner.put_record(
            Record::new("Task", RecordId(2))
                .with("status", "new")
                .with("price", FieldValue::Text("ten".into())),
        );
        let (root, cache) = root_with(
            RootConfig {
                ignore_deserialization_errors: ignore,
                ..RootConfig::with_prefix(PREFIX)
            },
            source.clone(),
        );
        root.register(
            task_schema(),
            ModelCacheConfig {
                allow_delete: true,
                ..ModelCacheConfig::enabled(0)
            },
        )
        .unwrap();
        // Left over from an earlier pass
        cache.set("sync:Task:2", "{\"id\":2,\"status\":\"new\",\"price\":\"9\"}", None).await.unwrap();

        let report = root.run_one_tick().await;
        if ignore {
            let pass = stats(report.outcome("Task"));
            assert_eq!((pass.upserted, pass.skipped, pass.deleted), (1, 1, 0));
            assert!(cached(&cache, "Task", 1).await.is_some());
            assert_eq!(cached(&cache, "Task", 2).await.unwrap()["price"], json!("9"));
        } else {
            assert_eq!(failure_kind(report.outcome("Task")), "deserialization");
            assert!(cached(&cache, "Task", 1).await.is_none());
            assert!(root.registry().last_synced("Task").is_none());
        }
    }
}

#[tokio::test]
async fn test_failed_model_does_not_affect_others() {
    let source = Arc::new(InstrumentedSource::new().failing("Task"));
    source.inner.put_record(task(1, "new", 1));
    source.inner.put_record(Record::new("User", RecordId(1)).with("name", "Ann"));
    let (root, cache) = root(source.clone());
    root.register(
        ModelSchema::new("User").with_field(FieldDef::new("name", FieldType::Text)),
        ModelCacheConfig::enabled(60),
    )
    .unwrap();
    root.register(task_schema(), ModelCacheConfig::enabled(60)).unwrap();

    let report = root.run_one_tick().await;
    assert_eq!(failure_kind(report.outcome("Task")), "source_unavailable");
    assert_eq!(report.synced().collect::<Vec<_>>(), vec!["User"]);
    assert_eq!(report.failed().collect::<Vec<_>>(), vec!["Task"]);
    assert!(cached(&cache, "User", 1).await.is_some());

    // Not marked synced, so retried on the next tick
    let report = root.run_one_tick().await;
    assert!(matches!(report.outcome("User"), Some(PassOutcome::NotDue)));
    assert!(matches!(report.outcome("Task"), Some(PassOutcome::Failed { .. })));
    assert_eq!(source.queries(), 3);
}

#[tokio::test]
async fn test_overlapping_tick_reports_busy() {
    let gate = Arc::new(Notify::new());
    let source = Arc::new(InstrumentedSource::new().gated(gate.clone()));
    source.inner.put_record(task(1, "new", 1));
    let (root, _cache) = root(source.clone());
    root.register(task_schema(), ModelCacheConfig::enabled(0)).unwrap();

    let first = tokio::spawn({
        let root = root.clone();
        async move { root.run_one_tick().await }
    });
    while root.model_phase("Task") != PassPhase::Fetching {
        tokio::task::yield_now().await;
    }

    let second = root.run_one_tick().await;
    assert!(matches!(second.outcome("Task"), Some(PassOutcome::Busy)));

    gate.notify_one();
    let first = first.await.unwrap();
    assert!(matches!(first.outcome("Task"), Some(PassOutcome::Synced(_))));
    assert_eq!(root.model_phase("Task"), PassPhase::Idle);
    assert_eq!(source.queries(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_source_timeout_fails_pass() {
    let source = Arc::new(InstrumentedSource::new().with_delay(Duration::from_secs(5)));
    source.inner.put_record(task(1, "new", 1));
    let (root, cache) = root_with(
        RootConfig {
            source_timeout_ms: 100,
            ..RootConfig::with_prefix(PREFIX)
        },
        source.clone(),
    );
    root.register(task_schema(), ModelCacheConfig::enabled(60)).unwrap();

    let report = root.run_one_tick().await;

    match report.outcome("Task") {
        Some(PassOutcome::Failed { kind, error }) => {
            assert_eq!(*kind, "source_unavailable");
            assert!(error.contains("100 ms"), "unexpected error: {}", error);
        }
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert!(cache.is_empty());
    assert_eq!(root.model_phase("Task"), PassPhase::Idle);
}

#[tokio::test]
async fn test_reregistration_forces_refresh() {
    let source = Arc::new(InstrumentedSource::new());
    source.inner.put_record(task(1, "new", 1));
    source.inner.put_record(task(2, "done", 2));
    let (root, cache) = root(source.clone());
    root.register(task_schema(), ModelCacheConfig::enabled(3600)).unwrap();

    root.run_one_tick().await;
    assert!(matches!(root.run_one_tick().await.outcome("Task"), Some(PassOutcome::NotDue)));

    root.register(
        task_schema(),
        ModelCacheConfig {
            allow_delete: true,
            ..ModelCacheConfig::enabled(3600).with_filter("status", json!("done"))
        },
    )
    .unwrap();

    let pass = stats(root.run_one_tick().await.outcome("Task"));
    assert_eq!((pass.upserted, pass.deleted), (1, 1));
    assert!(cached(&cache, "Task", 1).await.is_none());
    assert!(cached(&cache, "Task", 2).await.is_some());
}

#[tokio::test]
async fn test_hop_filter_reads_related_records_from_cache() {
    let source = Arc::new(InstrumentedSource::new());
    // Owners live only in the cache, so the source hands back bare ids
    source.inner.put_record(
        Record::new("Task", RecordId(1))
            .with("status", "new")
            .with("owner", RelatedRef::Id(RecordId(7))),
    );
    source.inner.put_record(
        Record::new("Task", RecordId(2))
            .with("status", "new")
            .with("owner", RelatedRef::Id(RecordId(8))),
    );
    source.inner.put_record(
        Record::new("Task", RecordId(3))
            .with("status", "new")
            .with("owner", RelatedRef::Id(RecordId(9))),
    );
    let (root, cache) = root(source.clone());
    cache.set("sync:User:7", "{\"id\":7,\"name\":\"Ann\"}", None).await.unwrap();
    cache.set("sync:User:8", "{\"id\":8,\"name\":\"Bob\"}", None).await.unwrap();

    root.register(
        ModelSchema::new("User").with_field(FieldDef::new("name", FieldType::Text)),
        ModelCacheConfig::default(),
    )
    .unwrap();
    root.register(
        ModelSchema::new("Task")
            .with_field(FieldDef::new("status", FieldType::Text))
            .with_field(FieldDef::new("owner", FieldType::ForeignKey("User".into())).nullable()),
        ModelCacheConfig::enabled(60).with_filter("owner__name", json!("Ann")),
    )
    .unwrap();

    let pass = stats(root.run_one_tick().await.outcome("Task"));

    assert_eq!(pass.upserted, 1);
    assert_eq!(cached(&cache, "Task", 1).await.unwrap()["owner"], json!(7));
    // Bob's task and the task with an uncached owner are both left out
    assert!(cached(&cache, "Task", 2).await.is_none());
    assert!(cached(&cache, "Task", 3).await.is_none());
}

#[tokio::test]
async fn test_filter_may_reference_excluded_field() {
    let source = Arc::new(InstrumentedSource::new());
    source.inner.put_record(task(1, "new", 1));
    source.inner.put_record(task(2, "done", 2));
    let (root, cache) = root(source.clone());
    root.register(
        task_schema(),
        ModelCacheConfig::enabled(60)
            .with_filter("status", json!("new"))
            .excluding(["status"]),
    )
    .unwrap();

    let pass = stats(root.run_one_tick().await.outcome("Task"));

    assert_eq!(pass.upserted, 1);
    assert_eq!(cached(&cache, "Task", 1).await, Some(json!({"id": 1, "price": "1"})));
    assert!(cached(&cache, "Task", 2).await.is_none());
}

// =============================================================================
// Write-through failures
// =============================================================================

fn writable() -> ModelCacheConfig {
    ModelCacheConfig {
        write_through: true,
        ..ModelCacheConfig::enabled(60)
    }
}

async fn seeded(source: InstrumentedSource) -> (Arc<CacheRoot>, Arc<InMemoryCacheStore>, Arc<InstrumentedSource>) {
    let source = Arc::new(source);
    for id in 1..=3 {
        source.inner.put_record(task(id, "new", id));
    }
    let (root, cache) = root(source.clone());
    root.register(task_schema(), writable()).unwrap();
    stats(root.run_one_tick().await.outcome("Task"));
    (root, cache, source)
}

#[tokio::test]
async fn test_failed_delete_drops_keys_already_processed() {
    let (root, cache, source) = seeded(InstrumentedSource::new().failing_id(2)).await;

    let err = root
        .delete("Task", &[RecordId(1), RecordId(2), RecordId(3)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "source_unavailable");

    assert!(source.inner.record("Task", RecordId(1)).is_none());
    assert!(cached(&cache, "Task", 1).await.is_none());
    // Unknown outcome: dropped so the next pass decides
    assert!(cached(&cache, "Task", 2).await.is_none());
    assert!(cached(&cache, "Task", 3).await.is_some());

    stats(root.run_one_tick().await.outcome("Task"));
    assert!(cached(&cache, "Task", 2).await.is_some());
}

#[tokio::test]
async fn test_failed_update_recaches_records_already_written() {
    let (root, cache, source) = seeded(InstrumentedSource::new().failing_id(2)).await;

    let changes = match json!({"status": "done"}) {
        Value::Object(m) => m,
        _ => unreachable!(),
    };
    let err = root
        .update("Task", &[RecordId(1), RecordId(2), RecordId(3)], changes)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "source_unavailable");

    let first = source.inner.record("Task", RecordId(1)).unwrap();
    assert_eq!(first.get("status"), Some(&FieldValue::Text("done".into())));
    assert_eq!(cached(&cache, "Task", 1).await.unwrap()["status"], json!("done"));
    assert!(cached(&cache, "Task", 2).await.is_none());
    assert_eq!(cached(&cache, "Task", 3).await.unwrap()["status"], json!("new"));
}
