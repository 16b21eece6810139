// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node walkthrough: index a handful of log entries, then relay messages.
//!
//! Demonstrates:
//! 1. Indexing entries of every object type (and a redelivery)
//! 2. Querying documents, streams, time series and geo
//! 3. Bridging broker traffic to the overlay and local subscribers
//! 4. Loop prevention when the overlay echoes a relay back
//! 5. Bridge metrics/health snapshots and captured `metrics` counters
//!
//! Indexes in memory unless `REDIS_URL` points at a Redis Stack server.
//! Bridge settings come from the `BRIDGE_*` environment variables.
//!
//! # Run
//!
//! ```bash
//! cargo run --example node_demo
//! REDIS_URL=redis://localhost:6379 RUST_LOG=debug cargo run --example node_demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use nodeweave::bridge::{Channel, InboundMessage, LocalSink, Transport, TransportBridge, TransportError};
use nodeweave::index::{CompareOp, Condition, DocumentQueryOptions, GeoCenter, GeoUnit, TimeSeriesQuery};
use nodeweave::{BridgeConfig, IndexConfig, NodeConfig, SecondaryIndexStore};

const LOG: &str = "/orbitdb/zdpuDemoLog";

/// Prints what would go out on the wire.
struct ConsoleTransport(&'static str);

#[async_trait]
impl Transport for ConsoleTransport {
    async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), TransportError> {
        println!("   → {} [{} qos={}] {}", self.0, topic, qos, String::from_utf8_lossy(payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        println!("   ⊕ {} subscribe {}", self.0, topic);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        println!("   ⊖ {} unsubscribe {}", self.0, topic);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

struct ConsoleSink;

#[async_trait]
impl LocalSink for ConsoleSink {
    async fn emit(&self, subscriber: &str, topic: &str, message: &Value) -> Result<(), TransportError> {
        println!("   → local:{} [{}] {}", subscriber, topic, message);
        Ok(())
    }
}

fn entry(object_type: &str, record_id: &str, timestamp: i64, data: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": LOG,
        "payload": {"op": "PUT", "key": record_id, "value": {
            "_id": record_id, "publicKey": "demo-key", "sig": "demo-sig",
            "timestamp": timestamp, "objectType": object_type, "data": data
        }}
    }))
    .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    let config = NodeConfig {
        index: IndexConfig {
            redis_url: std::env::var("REDIS_URL").ok(),
            ..Default::default()
        },
        bridge: BridgeConfig::from_env()?,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.bridge.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                 nodeweave: Node Walkthrough                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Index entries
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Indexing log entries...");
    let store = SecondaryIndexStore::from_config(&config.index).await?;

    let entries = [
        ("h-doc-1", entry("document", "alice", 1, json!({"name": "Alice", "age": 34}))),
        ("h-doc-2", entry("document", "bob", 2, json!({"name": "Bob", "age": 17}))),
        ("h-doc-3", entry("document", "alice", 3, json!({"name": "Alice", "age": 35}))),
        ("h-chat-1", entry("stream", "m1", 20, json!({"streamName": "chat", "text": "second"}))),
        ("h-chat-2", entry("stream", "m2", 10, json!({"streamName": "chat", "text": "first"}))),
        ("h-temp-1", entry("timeseries", "t1", 1_000, json!({"value": 20.5, "labels": {"room": "lab"}}))),
        ("h-temp-2", entry("timeseries", "t2", 2_000, json!({"value": 21.5}))),
        ("h-geo-1", entry("geo", "p", 1, json!({"locationLabel": "sicily", "member": "Palermo", "longitude": 13.361389, "latitude": 38.115556}))),
        ("h-geo-2", entry("geo", "c", 1, json!({"locationLabel": "sicily", "member": "Catania", "longitude": 15.087269, "latitude": 37.502669}))),
        ("h-rank-1", entry("sortedset", "p1", 42, json!({"player": "p1"}))),
    ];
    for (hash, raw) in &entries {
        let outcome = store.put(hash, raw).await?;
        println!("   ✓ {:<9} {:?}", hash, outcome);
    }
    let replay = store.put(entries[0].0, &entries[0].1).await?;
    println!("   ↻ redelivered {} → {:?}", entries[0].0, replay);

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Query
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔍 Querying...");
    let adults = [Condition::new("data.age", CompareOp::Gte, json!(18))];
    let docs = store.query_documents(LOG, &adults, &DocumentQueryOptions::default()).await?;
    println!("   adults: {}", serde_json::to_string(&docs)?);

    let chat = store.query_stream_last_n(LOG, "chat", 10).await?;
    let texts: Vec<&Value> = chat.iter().map(|m| &m.message["data"]["text"]).collect();
    println!("   chat (oldest first): {:?}", texts);

    let samples = store.query_time_series_range(LOG, 0, 10_000, &TimeSeriesQuery::default()).await?;
    println!("   temperature samples: {}", serde_json::to_string(&samples)?);

    let km = store.geo_distance(LOG, "sicily", "Palermo", "Catania", GeoUnit::Km).await?;
    println!("   Palermo ↔ Catania: {:.1} km", km.unwrap_or_default());
    let near = store
        .geo_search(LOG, "sicily", &GeoCenter::Member("Palermo".into()), 50.0, GeoUnit::Km)
        .await?;
    println!("   within 50 km of Palermo: {:?}", near.iter().map(|m| &m.member).collect::<Vec<_>>());

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Bridge
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔀 Bridging messages (node {})...", config.bridge.node_id);
    let node_id = config.bridge.node_id.clone();
    let bridge = Arc::new(TransportBridge::new(
        config.bridge,
        Arc::new(ConsoleTransport("overlay")),
        Arc::new(ConsoleTransport("broker")),
        Arc::new(ConsoleSink),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let purge = bridge.spawn_purge(Duration::from_secs(1), shutdown_rx);
    let (broker_tx, broker_rx) = mpsc::channel(64);
    let ingest = bridge.spawn_ingest(Channel::Broker, broker_rx);

    bridge.subscribe_local("browser-1", "sensors/lab").await?;
    bridge.subscribe_local("browser-2", "sensors/lab").await?;

    broker_tx
        .send(InboundMessage::new("sensors/lab", br#"{"temp":21.5}"#.to_vec()))
        .await?;
    broker_tx
        .send(InboundMessage::new("sensors/lab", br#"{"temp":21.5}"#.to_vec()))
        .await?;
    drop(broker_tx);
    ingest.await?;

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Loop prevention
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔁 Overlay echoes our relay back...");
    let echo = serde_json::to_vec(&json!({
        "__origin": "mqtt", "__broker": node_id, "__timestamp": 0, "data": {"temp": 21.5}
    }))?;
    let disposition = bridge.handle_inbound(Channel::Overlay, "sensors/lab", &echo).await;
    println!("   disposition: {:?}", disposition);

    bridge.disconnect_local("browser-1").await;
    bridge.disconnect_local("browser-2").await;

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Snapshots
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Bridge metrics:");
    println!("{}", serde_json::to_string_pretty(&bridge.metrics())?);
    println!("\n💚 Bridge health:");
    println!("{}", serde_json::to_string_pretty(&bridge.health())?);

    println!("\n📈 Captured metrics:");
    dump_metrics(&snapshotter);

    let _ = shutdown_tx.send(true);
    purge.await?;
    store.close().await?;

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Walkthrough complete!                      ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics, sorted by name
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => {
                    let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                    format!("count={} sum={:.6}", samples.len(), sum)
                }
            };
            format!("{}{} = {}", key.name(), label_str, rendered)
        })
        .collect();
    lines.sort();
    for line in lines {
        println!("   {}", line);
    }
}
