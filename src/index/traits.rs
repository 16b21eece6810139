// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::entry::{DecodeError, DocumentWrite, GeoAdd, SampleAdd, SortedAdd, StreamAppend};
use super::geo::{GeoCenter, GeoUnit};
use super::query::TimeSeriesQuery;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Entry could not be decoded: {0}")]
    Decode(#[from] DecodeError),
    #[error("Index backend error: {0}")]
    Backend(String),
    #[error("Series '{series}' already has a sample at {timestamp}")]
    DuplicateSample { series: String, timestamp: i64 },
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Geo member '{0}' not found")]
    MemberNotFound(String),
    #[error("Query timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Index store is closed")]
    Closed,
}

/// What a document write did to the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentOutcome {
    /// Stored as the current version of its record
    Stored,
    /// A newer version of the record is already current
    Superseded,
}

/// A stream message with the payload timestamp it is ordered by.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamRecord {
    pub timestamp: i64,
    pub message: Value,
}

/// A sorted-set member with its score (the payload timestamp).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRecord {
    pub timestamp: i64,
    pub record: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoMatch {
    pub member: String,
    /// Distance from the search center, in the requested unit
    pub distance: f64,
    pub position: GeoPoint,
}

/// Index structures backing the five object types.
///
/// Writers receive already-validated writes; the caller has claimed the entry
/// hash before calling, so implementations need not guard against the same
/// entry arriving twice.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    // Writers
    async fn write_document(&self, write: &DocumentWrite) -> Result<DocumentOutcome, IndexError>;
    async fn append_stream(&self, write: &StreamAppend) -> Result<(), IndexError>;
    async fn add_geo(&self, write: &GeoAdd) -> Result<(), IndexError>;
    /// Rejects a second sample at an existing timestamp with `DuplicateSample`.
    async fn add_sample(&self, write: &SampleAdd) -> Result<(), IndexError>;
    async fn add_sorted(&self, write: &SortedAdd) -> Result<(), IndexError>;

    // Raw entry retention
    async fn store_raw(&self, hash: &str, raw: &[u8]) -> Result<(), IndexError>;
    async fn get_raw(&self, hash: &str) -> Result<Option<Vec<u8>>, IndexError>;
    /// Raw entries in insertion order (or reversed), truncated to `amount`.
    async fn list_raw(&self, amount: Option<usize>, reverse: bool) -> Result<Vec<(String, Vec<u8>)>, IndexError>;

    // Reads
    /// Every live document in a log, unordered.
    async fn documents(&self, log_id: &str) -> Result<Vec<Value>, IndexError>;
    async fn stream_range(&self, log_id: &str, stream: &str, from: i64, to: i64) -> Result<Vec<StreamRecord>, IndexError>;
    /// The `n` newest messages, oldest first.
    async fn stream_last(&self, log_id: &str, stream: &str, n: usize) -> Result<Vec<StreamRecord>, IndexError>;
    async fn sorted_range(&self, log_key: &str, min: i64, max: i64) -> Result<Vec<ScoredRecord>, IndexError>;
    async fn series_range(&self, series: &str, from: i64, to: i64, query: &TimeSeriesQuery) -> Result<Vec<Sample>, IndexError>;
    async fn geo_position(&self, log_id: &str, label: &str, member: &str) -> Result<Option<GeoPoint>, IndexError>;
    async fn geo_distance(&self, log_id: &str, label: &str, a: &str, b: &str, unit: GeoUnit) -> Result<Option<f64>, IndexError>;
    async fn geo_hash(&self, log_id: &str, label: &str, member: &str) -> Result<Option<String>, IndexError>;
    /// Members within `radius` of the center, nearest first.
    async fn geo_search(
        &self,
        log_id: &str,
        label: &str,
        center: &GeoCenter,
        radius: f64,
        unit: GeoUnit,
    ) -> Result<Vec<GeoMatch>, IndexError>;

    /// Drop every index structure, dedup markers included.
    async fn clear(&self) -> Result<(), IndexError>;

    async fn close(&self) -> Result<(), IndexError> {
        Ok(())
    }
}

/// Persistent "seen hash" markers.
///
/// A hash moves through `unseen → claimed → processed`. Claims expire so an
/// entry whose writer died mid-flight can be retried on redelivery.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically claim an unseen hash. Only one caller wins.
    async fn try_claim(&self, hash: &str) -> Result<bool, IndexError>;
    async fn mark_processed(&self, hash: &str) -> Result<(), IndexError>;
    /// Give the hash back so a later delivery may retry it.
    async fn release_claim(&self, hash: &str) -> Result<(), IndexError>;
    async fn is_processed(&self, hash: &str) -> Result<bool, IndexError>;
}
