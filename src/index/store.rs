// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The storage contract the log engine calls, plus the typed query surface.
//!
//! # Write path
//!
//! ```text
//! put(hash, bytes)
//!   │
//!   ├─ decode ──err──► DecodeError (skipped, nothing claimed)
//!   ├─ DedupGuard::should_process ──false──► AlreadyProcessed
//!   ├─ route by object type ──► document | stream | geo | timeseries | sortedset
//!   │      └──err──► abandon claim, return error (redelivery may retry)
//!   └─ mark_processed ──► Indexed(type) | Superseded
//! ```
//!
//! # Example
//!
//! ```
//! use nodeweave::{IndexConfig, PutOutcome, SecondaryIndexStore};
//! use nodeweave::entry::ObjectType;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SecondaryIndexStore::in_memory(&IndexConfig::default());
//!
//! let raw = serde_json::to_vec(&json!({
//!     "id": "/orbitdb/zdpuLog",
//!     "payload": {"op": "PUT", "key": "r1", "value": {
//!         "_id": "r1", "publicKey": "pk", "sig": "s", "timestamp": 1,
//!         "objectType": "document", "data": {"name": "Alice"}
//!     }}
//! }))?;
//!
//! assert_eq!(store.put("zdpuHash1", &raw).await?, PutOutcome::Indexed(ObjectType::Document));
//! assert_eq!(store.put("zdpuHash1", &raw).await?, PutOutcome::AlreadyProcessed);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::IndexConfig;
use crate::entry::{self, IndexWrite, ObjectType};
use crate::metrics::{self, QueryTimer};
use super::dedup::DedupGuard;
use super::geo::{GeoCenter, GeoUnit};
use super::memory::InMemoryIndex;
use super::query::{run_document_query, Condition, DocumentQueryOptions, TimeSeriesQuery};
use super::redis::RedisIndex;
use super::traits::{
    DedupStore, DocumentOutcome, GeoMatch, GeoPoint, IndexBackend, IndexError, Sample, ScoredRecord, StreamRecord,
};

/// What `put` did with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Written into the index for its object type
    Indexed(ObjectType),
    /// This hash was already indexed (or is being indexed right now)
    AlreadyProcessed,
    /// A newer version of the same document record is already current
    Superseded,
}

/// Options for [`SecondaryIndexStore::iterator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterOptions {
    pub amount: Option<usize>,
    pub reverse: bool,
}

#[derive(Clone)]
pub struct SecondaryIndexStore {
    backend: Arc<dyn IndexBackend>,
    dedup: DedupGuard,
    query_timeout: Duration,
    retain_raw: bool,
    closed: Arc<AtomicBool>,
}

impl SecondaryIndexStore {
    /// Build on a backend that also persists dedup markers.
    pub fn new<B>(backend: Arc<B>, config: &IndexConfig) -> Self
    where
        B: IndexBackend + DedupStore + 'static,
    {
        let dedup: Arc<dyn DedupStore> = backend.clone();
        Self::with_parts(backend, dedup, config)
    }

    /// Build from separate index and dedup stores.
    pub fn with_parts(backend: Arc<dyn IndexBackend>, dedup: Arc<dyn DedupStore>, config: &IndexConfig) -> Self {
        Self {
            backend,
            dedup: DedupGuard::new(dedup),
            query_timeout: config.query_timeout(),
            retain_raw: config.retain_raw_entries,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Process-local store. Dedup markers do not survive restarts.
    pub fn in_memory(config: &IndexConfig) -> Self {
        let backend = InMemoryIndex::with_claim_ttl(config.claim_ttl())
            .with_retention_ms(config.timeseries_retention_ms);
        Self::new(Arc::new(backend), config)
    }

    /// Redis-backed when `redis_url` is set, in-memory otherwise.
    pub async fn from_config(config: &IndexConfig) -> Result<Self, IndexError> {
        match config.redis_url {
            Some(ref url) => {
                let backend = RedisIndex::connect(url, config).await?;
                info!(prefix = %config.key_prefix, "Index store using Redis backend");
                Ok(Self::new(Arc::new(backend), config))
            }
            None => {
                info!("Index store using in-memory backend");
                Ok(Self::in_memory(config))
            }
        }
    }

    /// A handle sharing this store's state but with its own query timeout.
    #[must_use]
    pub fn with_query_timeout(&self, timeout: Duration) -> Self {
        Self {
            query_timeout: timeout,
            ..self.clone()
        }
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    fn ensure_open(&self) -> Result<(), IndexError> {
        if self.closed.load(Ordering::Acquire) {
            Err(IndexError::Closed)
        } else {
            Ok(())
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Storage contract
    // ═══════════════════════════════════════════════════════════════════════

    /// Index one log entry. Idempotent per `hash`.
    #[instrument(skip(self, raw), fields(hash = %hash))]
    pub async fn put(&self, hash: &str, raw: &[u8]) -> Result<PutOutcome, IndexError> {
        self.ensure_open()?;

        let write = match entry::decode(hash, raw).and_then(|e| e.to_index_write()) {
            Ok(write) => write,
            Err(e) => {
                warn!(error = %e, "Skipping undecodable entry");
                metrics::record_decode_failure();
                return Err(e.into());
            }
        };
        let object_type = write.object_type();

        if !self.dedup.should_process(hash).await? {
            metrics::record_put(object_type.as_str(), "already_processed");
            return Ok(PutOutcome::AlreadyProcessed);
        }

        let start = Instant::now();
        let result = self.route(&write).await;
        metrics::record_write_latency(object_type.as_str(), start.elapsed());

        let document_outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(object_type = %object_type, error = %e, "Index write failed; entry left unprocessed");
                self.dedup.abandon(hash).await;
                metrics::record_put(object_type.as_str(), "error");
                return Err(e);
            }
        };

        if self.retain_raw {
            if let Err(e) = self.backend.store_raw(hash, raw).await {
                warn!(error = %e, "Failed to retain raw entry");
                self.dedup.abandon(hash).await;
                metrics::record_put(object_type.as_str(), "error");
                return Err(e);
            }
        }

        self.dedup.mark_processed(hash).await?;

        Ok(match document_outcome {
            DocumentOutcome::Stored => {
                debug!(object_type = %object_type, "Entry indexed");
                metrics::record_put(object_type.as_str(), "indexed");
                PutOutcome::Indexed(object_type)
            }
            DocumentOutcome::Superseded => {
                debug!("Entry superseded by a newer document version");
                metrics::record_put(object_type.as_str(), "superseded");
                PutOutcome::Superseded
            }
        })
    }

    async fn route(&self, write: &IndexWrite) -> Result<DocumentOutcome, IndexError> {
        match write {
            IndexWrite::Document(w) => self.backend.write_document(w).await,
            IndexWrite::Stream(w) => self.backend.append_stream(w).await.map(|_| DocumentOutcome::Stored),
            IndexWrite::Geo(w) => self.backend.add_geo(w).await.map(|_| DocumentOutcome::Stored),
            IndexWrite::Sample(w) => self.backend.add_sample(w).await.map(|_| DocumentOutcome::Stored),
            IndexWrite::Sorted(w) => self.backend.add_sorted(w).await.map(|_| DocumentOutcome::Stored),
        }
    }

    /// Raw entry bytes, when raw retention is enabled.
    pub async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>, IndexError> {
        if !self.retain_raw {
            self.ensure_open()?;
            return Ok(None);
        }
        self.timed("get", self.backend.get_raw(hash)).await
    }

    /// Retained `(hash, bytes)` pairs in insertion order.
    pub async fn iterator(&self, options: IterOptions) -> Result<Vec<(String, Vec<u8>)>, IndexError> {
        if !self.retain_raw {
            self.ensure_open()?;
            return Ok(Vec::new());
        }
        self.timed("iterator", self.backend.list_raw(options.amount, options.reverse)).await
    }

    pub async fn clear(&self) -> Result<(), IndexError> {
        self.ensure_open()?;
        self.backend.clear().await?;
        info!("Index store cleared");
        Ok(())
    }

    /// Close the store. Every later call fails with `Closed`.
    pub async fn close(&self) -> Result<(), IndexError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.backend.close().await
    }

    pub async fn is_processed(&self, hash: &str) -> Result<bool, IndexError> {
        self.ensure_open()?;
        self.dedup.is_processed(hash).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Query surface
    // ═══════════════════════════════════════════════════════════════════════

    async fn timed<T, F>(&self, query: &'static str, fut: F) -> Result<T, IndexError>
    where
        F: Future<Output = Result<T, IndexError>>,
    {
        self.ensure_open()?;
        let _timer = QueryTimer::new(query);
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(Ok(value)) => {
                metrics::record_query(query, "success");
                Ok(value)
            }
            Ok(Err(e)) => {
                metrics::record_query(query, "error");
                Err(e)
            }
            Err(_) => {
                warn!(query, timeout = ?self.query_timeout, "Index query timed out");
                metrics::record_query(query, "timeout");
                Err(IndexError::Timeout(self.query_timeout))
            }
        }
    }

    /// Live documents of a log matching every condition, sorted then paginated.
    #[instrument(skip(self, conditions, options))]
    pub async fn query_documents(
        &self,
        log_id: &str,
        conditions: &[Condition],
        options: &DocumentQueryOptions,
    ) -> Result<Vec<Value>, IndexError> {
        let docs = self.timed("documents", self.backend.documents(log_id)).await?;
        let results = run_document_query(docs, conditions, options);
        metrics::record_query_results("documents", results.len());
        Ok(results)
    }

    /// Stream messages with `from <= timestamp <= to`, oldest first.
    #[instrument(skip(self))]
    pub async fn query_stream_range(&self, log_id: &str, stream: &str, from: i64, to: i64) -> Result<Vec<StreamRecord>, IndexError> {
        self.timed("stream_range", self.backend.stream_range(log_id, stream, from, to)).await
    }

    /// The `n` newest stream messages, returned oldest first.
    #[instrument(skip(self))]
    pub async fn query_stream_last_n(&self, log_id: &str, stream: &str, n: usize) -> Result<Vec<StreamRecord>, IndexError> {
        self.timed("stream_last", self.backend.stream_last(log_id, stream, n)).await
    }

    #[instrument(skip(self))]
    pub async fn query_sorted_set_range(&self, log_id: &str, min_score: i64, max_score: i64) -> Result<Vec<ScoredRecord>, IndexError> {
        let key = entry::log_key(log_id);
        self.timed("sorted_range", self.backend.sorted_range(key, min_score, max_score)).await
    }

    #[instrument(skip(self, query))]
    pub async fn query_time_series_range(
        &self,
        log_id: &str,
        from: i64,
        to: i64,
        query: &TimeSeriesQuery,
    ) -> Result<Vec<Sample>, IndexError> {
        query.validate()?;
        let series = entry::log_key(log_id);
        self.timed("series_range", self.backend.series_range(series, from, to, query)).await
    }

    /// Distance between two members; `None` if either is missing.
    pub async fn geo_distance(&self, log_id: &str, label: &str, a: &str, b: &str, unit: GeoUnit) -> Result<Option<f64>, IndexError> {
        self.timed("geo_distance", self.backend.geo_distance(log_id, label, a, b, unit)).await
    }

    pub async fn geo_position(&self, log_id: &str, label: &str, member: &str) -> Result<Option<GeoPoint>, IndexError> {
        self.timed("geo_position", self.backend.geo_position(log_id, label, member)).await
    }

    pub async fn geo_hash(&self, log_id: &str, label: &str, member: &str) -> Result<Option<String>, IndexError> {
        self.timed("geo_hash", self.backend.geo_hash(log_id, label, member)).await
    }

    /// Members within `radius` of a point or of an existing member, nearest first.
    pub async fn geo_search(
        &self,
        log_id: &str,
        label: &str,
        center: &GeoCenter,
        radius: f64,
        unit: GeoUnit,
    ) -> Result<Vec<GeoMatch>, IndexError> {
        if !radius.is_finite() || radius < 0.0 {
            return Err(IndexError::InvalidPayload(format!("invalid search radius {}", radius)));
        }
        self.timed("geo_search", self.backend.geo_search(log_id, label, center, radius, unit)).await
    }
}
