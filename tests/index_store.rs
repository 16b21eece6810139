// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage-engine behaviour against the in-memory backend.
//!
//! Run with: cargo test --test index_store

use std::sync::Arc;

use nodeweave::entry::ObjectType;
use nodeweave::index::{
    Aggregation, AggregationKind, CompareOp, Condition, DocumentQueryOptions, GeoCenter, GeoUnit, SortOrder,
    TimeSeriesQuery,
};
use nodeweave::{IndexConfig, IndexError, IterOptions, PutOutcome, SecondaryIndexStore};
use serde_json::{json, Value};

const LOG: &str = "/orbitdb/zdpuTestLog";

fn store() -> SecondaryIndexStore {
    SecondaryIndexStore::in_memory(&IndexConfig::default())
}

fn entry(object_type: &str, record_id: &str, timestamp: i64, data: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": LOG,
        "payload": {"op": "PUT", "key": record_id, "value": {
            "_id": record_id, "publicKey": "pk", "sig": "sig",
            "timestamp": timestamp, "objectType": object_type, "data": data
        }}
    }))
    .unwrap()
}

fn stream_entry(timestamp: i64, text: &str) -> Vec<u8> {
    entry("stream", &format!("m{timestamp}"), timestamp, json!({"streamName": "chat", "text": text}))
}

// ═══════════════════════════════════════════════════════════════════════════
// Idempotency
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_second_put_of_same_hash_is_a_noop() {
    let store = store();
    let raw = stream_entry(10, "hello");

    assert_eq!(store.put("h1", &raw).await.unwrap(), PutOutcome::Indexed(ObjectType::Stream));
    assert_eq!(store.put("h1", &raw).await.unwrap(), PutOutcome::AlreadyProcessed);

    let messages = store.query_stream_last_n(LOG, "chat", 10).await.unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn test_concurrent_puts_of_same_hash_write_once() {
    let store = store();
    let raw = Arc::new(entry("timeseries", "s", 1_000, json!({"value": 1.5})));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        let raw = raw.clone();
        handles.push(tokio::spawn(async move { store.put("same-hash", &raw).await }));
    }

    let mut indexed = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            PutOutcome::Indexed(ObjectType::TimeSeries) => indexed += 1,
            PutOutcome::AlreadyProcessed => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(indexed, 1);

    let samples = store
        .query_time_series_range(LOG, 0, 2_000, &TimeSeriesQuery::default())
        .await
        .unwrap();
    assert_eq!(samples.len(), 1);
}

#[tokio::test]
async fn test_undecodable_entry_is_not_marked_processed() {
    let store = store();
    let bad = entry("geo", "g", 1, json!({"member": "m"}));

    assert!(matches!(store.put("h", &bad).await, Err(IndexError::Decode(_))));
    assert!(!store.is_processed("h").await.unwrap());
}

// ═══════════════════════════════════════════════════════════════════════════
// Type isolation
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_types_do_not_leak_into_each_other() {
    let store = store();
    store
        .put("d", &entry("document", "r1", 5, json!({"streamName": "chat"})))
        .await
        .unwrap();
    store.put("s", &stream_entry(5, "only in stream")).await.unwrap();

    let docs = store
        .query_documents(LOG, &[], &DocumentQueryOptions::default())
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["_id"], "r1");

    let messages = store.query_stream_range(LOG, "chat", 0, 100).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message["data"]["text"], "only in stream");

    assert!(store
        .query_sorted_set_range(LOG, 0, 100)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_unknown_object_type_is_a_document() {
    let store = store();
    let outcome = store
        .put("h", &entry("hologram", "r1", 1, json!({"x": 1})))
        .await
        .unwrap();
    assert_eq!(outcome, PutOutcome::Indexed(ObjectType::Document));
}

// ═══════════════════════════════════════════════════════════════════════════
// Documents
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_latest_wins_in_order() {
    let store = store();
    store.put("h1", &entry("document", "r", 1, json!({"v": "old"}))).await.unwrap();
    store.put("h2", &entry("document", "r", 2, json!({"v": "new"}))).await.unwrap();

    let docs = store.query_documents(LOG, &[], &DocumentQueryOptions::default()).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["data"]["v"], "new");
}

#[tokio::test]
async fn test_latest_wins_out_of_order() {
    let store = store();
    store.put("h2", &entry("document", "r", 2, json!({"v": "new"}))).await.unwrap();
    let outcome = store.put("h1", &entry("document", "r", 1, json!({"v": "old"}))).await.unwrap();
    assert_eq!(outcome, PutOutcome::Superseded);
    // Superseded entries are still done
    assert!(store.is_processed("h1").await.unwrap());

    let docs = store.query_documents(LOG, &[], &DocumentQueryOptions::default()).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["data"]["v"], "new");
}

#[tokio::test]
async fn test_equal_timestamps_converge_on_larger_hash() {
    let a = store();
    let b = store();
    let low = entry("document", "r", 7, json!({"v": "low"}));
    let high = entry("document", "r", 7, json!({"v": "high"}));

    a.put("hashA", &low).await.unwrap();
    a.put("hashB", &high).await.unwrap();
    b.put("hashB", &high).await.unwrap();
    b.put("hashA", &low).await.unwrap();

    let opts = DocumentQueryOptions::default();
    let from_a = a.query_documents(LOG, &[], &opts).await.unwrap();
    let from_b = b.query_documents(LOG, &[], &opts).await.unwrap();
    assert_eq!(from_a, from_b);
    assert_eq!(from_a[0]["data"]["v"], "high");
}

#[tokio::test]
async fn test_document_query_filters_sorts_and_paginates() {
    let store = store();
    for (i, (name, age)) in [("ann", 31), ("bob", 17), ("cyd", 45), ("dee", 28)].iter().enumerate() {
        store
            .put(&format!("h{i}"), &entry("document", name, i as i64, json!({"name": name, "age": age})))
            .await
            .unwrap();
    }

    let adults = [Condition::new("data.age", CompareOp::Gte, json!(18))];
    let options = DocumentQueryOptions {
        limit: Some(2),
        offset: 0,
        sort_by: Some("data.age".into()),
        sort_order: SortOrder::Desc,
    };
    let page = store.query_documents(LOG, &adults, &options).await.unwrap();
    let names: Vec<&str> = page.iter().map(|d| d["data"]["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["cyd", "ann"]);

    let second = DocumentQueryOptions { offset: 2, ..options };
    let page = store.query_documents(LOG, &adults, &second).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0]["data"]["name"], "dee");
}

// ═══════════════════════════════════════════════════════════════════════════
// Streams
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_stream_orders_by_payload_timestamp() {
    let store = store();
    for (hash, ts) in [("a", 5), ("b", 1), ("c", 3)] {
        store.put(hash, &stream_entry(ts, &format!("t{ts}"))).await.unwrap();
    }

    let all = store.query_stream_range(LOG, "chat", 0, 10).await.unwrap();
    let timestamps: Vec<i64> = all.iter().map(|m| m.timestamp).collect();
    assert_eq!(timestamps, vec![1, 3, 5]);

    let last_two = store.query_stream_last_n(LOG, "chat", 2).await.unwrap();
    let timestamps: Vec<i64> = last_two.iter().map(|m| m.timestamp).collect();
    assert_eq!(timestamps, vec![3, 5]);
}

#[tokio::test]
async fn test_stream_keeps_same_timestamp_messages() {
    let store = store();
    store.put("a", &stream_entry(4, "one")).await.unwrap();
    store
        .put("b", &entry("stream", "other", 4, json!({"streamName": "chat", "text": "two"})))
        .await
        .unwrap();

    assert_eq!(store.query_stream_range(LOG, "chat", 4, 4).await.unwrap().len(), 2);
}

// ═══════════════════════════════════════════════════════════════════════════
// Time series
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_time_series_is_write_once_per_timestamp() {
    let store = store();
    store.put("a", &entry("timeseries", "s", 100, json!({"value": 1}))).await.unwrap();
    let err = store
        .put("b", &entry("timeseries", "s", 100, json!({"value": 2})))
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::DuplicateSample { timestamp: 100, .. }));
    // The failed entry stays unprocessed so it can be inspected or retried
    assert!(!store.is_processed("b").await.unwrap());

    let samples = store
        .query_time_series_range(LOG, 0, 1_000, &TimeSeriesQuery::default())
        .await
        .unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].value, 1.0);
}

#[tokio::test]
async fn test_time_series_aggregation() {
    let store = store();
    for (i, (ts, v)) in [(0, 1.0), (500, 3.0), (1_000, 10.0), (1_999, 20.0)].iter().enumerate() {
        store
            .put(&format!("h{i}"), &entry("timeseries", "s", *ts, json!({"value": v})))
            .await
            .unwrap();
    }

    let query = TimeSeriesQuery {
        aggregation: Some(Aggregation { kind: AggregationKind::Avg, bucket_ms: 1_000 }),
        ..Default::default()
    };
    let buckets = store.query_time_series_range(LOG, 0, 2_000, &query).await.unwrap();
    assert_eq!(buckets.len(), 2);
    assert_eq!((buckets[0].timestamp, buckets[0].value), (0, 2.0));
    assert_eq!((buckets[1].timestamp, buckets[1].value), (1_000, 15.0));

    let bad = TimeSeriesQuery {
        aggregation: Some(Aggregation { kind: AggregationKind::Sum, bucket_ms: 0 }),
        ..Default::default()
    };
    assert!(matches!(
        store.query_time_series_range(LOG, 0, 2_000, &bad).await,
        Err(IndexError::InvalidPayload(_))
    ));
}

// ═══════════════════════════════════════════════════════════════════════════
// Geo
// ═══════════════════════════════════════════════════════════════════════════

fn place(member: &str, lon: f64, lat: f64) -> Vec<u8> {
    entry(
        "geo",
        member,
        1,
        json!({"locationLabel": "sicily", "member": member, "longitude": lon, "latitude": lat}),
    )
}

#[tokio::test]
async fn test_geo_latest_write_replaces_position() {
    let store = store();
    store.put("a", &place("van", 13.0, 38.0)).await.unwrap();
    store.put("b", &place("van", 15.0, 37.5)).await.unwrap();

    let pos = store.geo_position(LOG, "sicily", "van").await.unwrap().unwrap();
    assert!((pos.longitude - 15.0).abs() < 1e-9);
    assert!((pos.latitude - 37.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_geo_distance_and_search() {
    let store = store();
    store.put("a", &place("Palermo", 13.361389, 38.115556)).await.unwrap();
    store.put("b", &place("Catania", 15.087269, 37.502669)).await.unwrap();

    let km = store
        .geo_distance(LOG, "sicily", "Palermo", "Catania", GeoUnit::Km)
        .await
        .unwrap()
        .unwrap();
    assert!((km - 166.274).abs() < 0.01);

    let near_palermo = store
        .geo_search(LOG, "sicily", &GeoCenter::Member("Palermo".into()), 100.0, GeoUnit::Km)
        .await
        .unwrap();
    assert_eq!(near_palermo.len(), 1);
    assert_eq!(near_palermo[0].member, "Palermo");

    let both = store
        .geo_search(LOG, "sicily", &GeoCenter::Member("Catania".into()), 200.0, GeoUnit::Km)
        .await
        .unwrap();
    let members: Vec<&str> = both.iter().map(|m| m.member.as_str()).collect();
    assert_eq!(members, vec!["Catania", "Palermo"]);

    assert!(matches!(
        store
            .geo_search(LOG, "sicily", &GeoCenter::Member("Messina".into()), 10.0, GeoUnit::Km)
            .await,
        Err(IndexError::MemberNotFound(_))
    ));
}

#[tokio::test]
async fn test_geo_rejects_out_of_range_latitude() {
    let store = store();
    assert!(matches!(
        store.put("a", &place("pole", 0.0, 89.0)).await,
        Err(IndexError::Decode(_))
    ));
}

// ═══════════════════════════════════════════════════════════════════════════
// Sorted sets
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_sorted_set_dedupes_by_record() {
    let store = store();
    store.put("a", &entry("sortedset", "player1", 10, json!({"score": 1}))).await.unwrap();
    store.put("b", &entry("sortedset", "player2", 20, json!({"score": 2}))).await.unwrap();
    store.put("c", &entry("sortedset", "player1", 30, json!({"score": 3}))).await.unwrap();

    let all = store.query_sorted_set_range(LOG, 0, 100).await.unwrap();
    let scores: Vec<i64> = all.iter().map(|r| r.timestamp).collect();
    assert_eq!(scores, vec![20, 30]);
    assert_eq!(all[1].record["_id"], "player1");

    let window = store.query_sorted_set_range(LOG, 15, 25).await.unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].record["_id"], "player2");
}

// ═══════════════════════════════════════════════════════════════════════════
// Storage contract
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_raw_retention_serves_get_and_iterator() {
    let config = IndexConfig { retain_raw_entries: true, ..Default::default() };
    let store = SecondaryIndexStore::in_memory(&config);
    let first = stream_entry(1, "a");
    let second = stream_entry(2, "b");
    store.put("h1", &first).await.unwrap();
    store.put("h2", &second).await.unwrap();

    assert_eq!(store.get("h1").await.unwrap(), Some(first));
    assert_eq!(store.get("missing").await.unwrap(), None);

    let forward = store.iterator(IterOptions::default()).await.unwrap();
    let hashes: Vec<&str> = forward.iter().map(|(h, _)| h.as_str()).collect();
    assert_eq!(hashes, vec!["h1", "h2"]);

    let newest = store.iterator(IterOptions { amount: Some(1), reverse: true }).await.unwrap();
    assert_eq!(newest[0].0, "h2");
}

#[tokio::test]
async fn test_clear_forgets_entries_and_markers() {
    let store = store();
    let raw = stream_entry(1, "a");
    store.put("h1", &raw).await.unwrap();
    store.clear().await.unwrap();

    assert!(store.query_stream_range(LOG, "chat", 0, 10).await.unwrap().is_empty());
    assert_eq!(store.put("h1", &raw).await.unwrap(), PutOutcome::Indexed(ObjectType::Stream));
}
