// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic model-cache-sync usage example.
//!
//! Demonstrates:
//! 1. Declaring two models and registering them on a cache root
//! 2. Seeding the source store and running one reconciliation tick
//! 3. Cache-first reads with lookups and ordering
//! 4. Write-through create / update / delete
//! 5. Displaying metrics
//!
//! Runs entirely in-process; swap the in-memory stores for
//! `RedisCacheStore` / `SqlSourceStore` to talk to real backends.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use rust_decimal::Decimal;
use serde_json::{json, Value};

use model_cache_sync::record::{Record, RecordId, RelatedRef};
use model_cache_sync::schema::{FieldDef, FieldType, ModelSchema};
use model_cache_sync::storage::memory::{InMemoryCacheStore, InMemorySourceStore};
use model_cache_sync::{CacheRoot, LookupOp, Lookups, ModelCacheConfig, RootConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           model-cache-sync: Basic Usage Example               ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Models and root
    // ─────────────────────────────────────────────────────────────────────────
    let user = ModelSchema::new("User").with_field(FieldDef::new("name", FieldType::Text));
    let task = ModelSchema::new("Task")
        .with_field(
            FieldDef::new("status", FieldType::Text)
                .with_choices(vec![json!("new"), json!("in_work"), json!("done")]),
        )
        .with_field(FieldDef::new("price", FieldType::Decimal))
        .with_field(FieldDef::new("owner", FieldType::ForeignKey("User".into())).nullable());

    let cache = Arc::new(InMemoryCacheStore::new());
    let source = Arc::new(InMemorySourceStore::new());
    let root = Arc::new(CacheRoot::new(
        RootConfig::with_prefix("demo"),
        cache.clone(),
        source.clone(),
    )?);

    let writable = ModelCacheConfig {
        write_through: true,
        allow_delete: true,
        ..ModelCacheConfig::enabled(300)
    };
    root.register(user, writable.clone())?;
    root.register(task, writable.with_filter("status__in", json!(["new", "in_work"])))?;
    println!("📦 Registered: User, Task (status in new/in_work)");

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Seed the source and reconcile
    // ─────────────────────────────────────────────────────────────────────────
    source.put_record(Record::new("User", RecordId(1)).with("name", "Ann"));
    source.put_record(Record::new("User", RecordId(2)).with("name", "Bob"));
    for (id, status, price, owner) in [
        (1, "new", 12, 1),
        (2, "in_work", 40, 2),
        (3, "done", 7, 1),
        (4, "new", 3, 1),
    ] {
        source.put_record(
            Record::new("Task", RecordId(id))
                .with("status", status)
                .with("price", Decimal::from(price))
                .with("owner", RelatedRef::Id(RecordId(owner))),
        );
    }

    println!("\n🔄 Running one tick...");
    let report = root.run_one_tick().await;
    for (model, outcome) in &report.outcomes {
        println!("   └─ {}: {:?}", model, outcome);
    }
    println!("   Cache now holds {} keys", cache.len());

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Cache-first reads
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Ann's tasks, most expensive first:");
    let anns = root
        .get(
            "Task",
            &Lookups::new()
                .related("owner", "name", LookupOp::Exact, json!("Ann"))
                .build(),
        )
        .await?;
    for task in root.order_by("Task", anns, "-price")? {
        println!("   └─ #{} {} {}", task["id"], task["status"], task["price"]);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Write-through
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Write-through:");
    let created = root
        .create("Task", as_mapping(json!({"status": "new", "price": "9.99", "owner": 2})))
        .await?;
    let id = RecordId::from_mapping(&created).ok_or("created record has no id")?;
    println!("   └─ created #{} → {}", id, Value::Object(created));

    root.update("Task", &[id], as_mapping(json!({"status": "done"}))).await?;
    let still_cached = root.get("Task", &Lookups::new().id(id.0).build()).await?;
    println!(
        "   └─ marked done; cached copy {}",
        if still_cached.is_empty() { "dropped (filtered out)" } else { "kept" }
    );

    let removed = root.delete("Task", &[RecordId(1)]).await?;
    println!("   └─ deleted {} record(s)", removed);

    let by_id = root.get_map("Task", &[]).await?;
    println!("   └─ cached tasks: {:?}", by_id.keys().collect::<Vec<_>>());

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Metrics:");
    dump_metrics(&snapshotter);

    Ok(())
}

fn as_mapping(value: Value) -> model_cache_sync::Mapping {
    match value {
        Value::Object(map) => map,
        _ => model_cache_sync::Mapping::new(),
    }
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines = Vec::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let rendered = match value {
            DebugValue::Counter(v) => v.to_string(),
            DebugValue::Gauge(v) => format!("{:.0}", v.into_inner()),
            DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
        };
        lines.push(format!("{}{} = {}", key.name(), label_str, rendered));
    }
    lines.sort();
    for line in lines {
        println!("   └─ {}", line);
    }
}
