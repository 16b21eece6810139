// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for nodeweave.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding node is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `nodeweave_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `object_type`: document, stream, geo, timeseries, sortedset
//! - `query`: documents, stream_range, stream_last, sorted_range, series_range, geo_*
//! - `channel`: overlay, broker, local
//! - `outcome`: indexed, already_processed, superseded, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// INDEX STORE - Entry ingestion and queries
// ═══════════════════════════════════════════════════════════════════════════

/// Record the outcome of a `put`
pub fn record_put(object_type: &str, outcome: &str) {
    counter!(
        "nodeweave_index_puts_total",
        "object_type" => object_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an entry that could not be decoded
pub fn record_decode_failure() {
    counter!("nodeweave_index_decode_failures_total").increment(1);
}

/// Record index write latency
pub fn record_write_latency(object_type: &str, duration: Duration) {
    histogram!(
        "nodeweave_index_write_seconds",
        "object_type" => object_type.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a query execution
pub fn record_query(query: &str, status: &str) {
    counter!(
        "nodeweave_index_queries_total",
        "query" => query.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record query latency
pub fn record_query_latency(query: &str, duration: Duration) {
    histogram!(
        "nodeweave_index_query_seconds",
        "query" => query.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record query result count
pub fn record_query_results(query: &str, count: usize) {
    histogram!(
        "nodeweave_index_query_results",
        "query" => query.to_string()
    )
    .record(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// BRIDGE - Message flow between transports
// ═══════════════════════════════════════════════════════════════════════════

/// Record a bridge event on a channel (received, published, failed, ...)
pub fn record_bridge_message(channel: &str, event: &str) {
    counter!(
        "nodeweave_bridge_messages_total",
        "channel" => channel.to_string(),
        "event" => event.to_string()
    )
    .increment(1);
}

/// Record a message suppressed by loop prevention
pub fn record_loop_prevented() {
    counter!("nodeweave_bridge_loops_prevented_total").increment(1);
}

/// Record forward latency to a destination channel
pub fn record_forward_latency(channel: &str, duration: Duration) {
    histogram!(
        "nodeweave_bridge_forward_seconds",
        "channel" => channel.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set number of topics with local subscribers
pub fn set_local_topics(count: usize) {
    gauge!("nodeweave_bridge_local_topics").set(count as f64);
}

/// Set loop-guard fingerprint count
pub fn set_loop_guard_entries(count: usize) {
    gauge!("nodeweave_bridge_loop_guard_entries").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKER - Resilience metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Set circuit breaker state (0 = closed, 1 = half-open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "nodeweave_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "nodeweave_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// A timing guard that records query latency on drop
pub struct QueryTimer {
    query: &'static str,
    start: Instant,
}

impl QueryTimer {
    pub fn new(query: &'static str) -> Self {
        Self {
            query,
            start: Instant::now(),
        }
    }
}

impl Drop for QueryTimer {
    fn drop(&mut self) {
        record_query_latency(self.query, self.start.elapsed());
    }
}
