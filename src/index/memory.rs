// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process index backend.
//!
//! Same semantics as the Redis backend, minus persistence: dedup markers and
//! indices live only as long as the process. Used for tests and ephemeral
//! nodes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::entry::{DocumentWrite, GeoAdd, SampleAdd, SortedAdd, StreamAppend};
use super::geo::{self, GeoCenter, GeoUnit};
use super::query::TimeSeriesQuery;
use super::traits::{
    DedupStore, DocumentOutcome, GeoMatch, GeoPoint, IndexBackend, IndexError, Sample, ScoredRecord, StreamRecord,
};

const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(30);

enum Seen {
    InFlight(Instant),
    Done,
}

#[derive(Default)]
struct DocCollection {
    /// entry hash → stored record
    docs: HashMap<String, Value>,
    /// record id → (timestamp, hash) of its current version
    by_record: HashMap<String, (i64, String)>,
}

struct Series {
    /// Fixed by the first sample, as RedisTimeSeries does on key creation
    labels: BTreeMap<String, String>,
    samples: BTreeMap<i64, f64>,
}

#[derive(Default)]
struct SortedCollection {
    members: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
    /// record id → member currently holding it
    by_record: HashMap<String, String>,
}

impl SortedCollection {
    fn remove_member(&mut self, member: &str) {
        if let Some(score) = self.scores.remove(member) {
            self.members.remove(&(score, member.to_string()));
        }
    }
}

#[derive(Default)]
struct RawLog {
    order: Vec<String>,
    bytes: HashMap<String, Vec<u8>>,
}

pub struct InMemoryIndex {
    seen: DashMap<String, Seen>,
    claim_ttl: Duration,
    /// 0 keeps samples forever
    retention_ms: i64,
    documents: DashMap<String, DocCollection>,
    streams: DashMap<(String, String), BTreeMap<(i64, u64), Value>>,
    stream_seq: AtomicU64,
    geo: DashMap<(String, String), HashMap<String, GeoPoint>>,
    series: DashMap<String, Series>,
    sorted: DashMap<String, SortedCollection>,
    raw: Mutex<RawLog>,
}

impl InMemoryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::with_claim_ttl(DEFAULT_CLAIM_TTL)
    }

    #[must_use]
    pub fn with_claim_ttl(claim_ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            claim_ttl,
            retention_ms: 0,
            documents: DashMap::new(),
            streams: DashMap::new(),
            stream_seq: AtomicU64::new(0),
            geo: DashMap::new(),
            series: DashMap::new(),
            sorted: DashMap::new(),
            raw: Mutex::new(RawLog::default()),
        }
    }

    /// Reject and prune samples older than `newest - retention`.
    #[must_use]
    pub fn with_retention_ms(mut self, retention_ms: u64) -> Self {
        self.retention_ms = i64::try_from(retention_ms).unwrap_or(i64::MAX);
        self
    }

    /// Labels a series was created with.
    pub fn series_labels(&self, series: &str) -> Option<BTreeMap<String, String>> {
        self.series.get(series).map(|s| s.labels.clone())
    }

    fn geo_key(log_id: &str, label: &str) -> (String, String) {
        (log_id.to_string(), label.to_string())
    }

    fn position(&self, log_id: &str, label: &str, member: &str) -> Option<GeoPoint> {
        self.geo
            .get(&Self::geo_key(log_id, label))
            .and_then(|set| set.get(member).copied())
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_member(member: &str) -> Value {
    serde_json::from_str(member).unwrap_or_else(|_| Value::String(member.to_string()))
}

#[async_trait]
impl DedupStore for InMemoryIndex {
    async fn try_claim(&self, hash: &str) -> Result<bool, IndexError> {
        match self.seen.entry(hash.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(Seen::InFlight(Instant::now()));
                Ok(true)
            }
            Entry::Occupied(mut slot) => {
                let expired = match slot.get() {
                    Seen::Done => false,
                    Seen::InFlight(at) => at.elapsed() >= self.claim_ttl,
                };
                if expired {
                    slot.insert(Seen::InFlight(Instant::now()));
                }
                Ok(expired)
            }
        }
    }

    async fn mark_processed(&self, hash: &str) -> Result<(), IndexError> {
        self.seen.insert(hash.to_string(), Seen::Done);
        Ok(())
    }

    async fn release_claim(&self, hash: &str) -> Result<(), IndexError> {
        self.seen.remove_if(hash, |_, seen| matches!(seen, Seen::InFlight(_)));
        Ok(())
    }

    async fn is_processed(&self, hash: &str) -> Result<bool, IndexError> {
        Ok(matches!(self.seen.get(hash).as_deref(), Some(Seen::Done)))
    }
}

#[async_trait]
impl IndexBackend for InMemoryIndex {
    async fn write_document(&self, write: &DocumentWrite) -> Result<DocumentOutcome, IndexError> {
        let mut collection = self.documents.entry(write.log_id.clone()).or_default();
        let DocCollection { docs, by_record } = &mut *collection;

        if let Some(record_id) = &write.record_id {
            if let Some((current_ts, current_hash)) = by_record.get(record_id) {
                // Equal timestamps fall to the larger hash so replicas agree
                if (write.timestamp, write.hash.as_str()) <= (*current_ts, current_hash.as_str()) {
                    return Ok(DocumentOutcome::Superseded);
                }
                docs.remove(current_hash);
            }
            by_record.insert(record_id.clone(), (write.timestamp, write.hash.clone()));
        }
        docs.insert(write.hash.clone(), write.document.clone());
        Ok(DocumentOutcome::Stored)
    }

    async fn append_stream(&self, write: &StreamAppend) -> Result<(), IndexError> {
        let seq = self.stream_seq.fetch_add(1, Ordering::Relaxed);
        self.streams
            .entry((write.log_id.clone(), write.stream_name.clone()))
            .or_default()
            .insert((write.timestamp, seq), write.message.clone());
        Ok(())
    }

    async fn add_geo(&self, write: &GeoAdd) -> Result<(), IndexError> {
        self.geo.entry(Self::geo_key(&write.log_id, &write.label)).or_default().insert(
            write.member.clone(),
            GeoPoint { longitude: write.longitude, latitude: write.latitude },
        );
        Ok(())
    }

    async fn add_sample(&self, write: &SampleAdd) -> Result<(), IndexError> {
        let mut series = self.series.entry(write.series.clone()).or_insert_with(|| Series {
            labels: write.labels.clone(),
            samples: BTreeMap::new(),
        });

        if self.retention_ms > 0 {
            if let Some((&newest, _)) = series.samples.last_key_value() {
                if write.timestamp < newest.saturating_sub(self.retention_ms) {
                    return Err(IndexError::InvalidPayload(format!(
                        "sample at {} is older than the retention window of '{}'",
                        write.timestamp, write.series
                    )));
                }
            }
        }
        if series.samples.contains_key(&write.timestamp) {
            return Err(IndexError::DuplicateSample {
                series: write.series.clone(),
                timestamp: write.timestamp,
            });
        }
        series.samples.insert(write.timestamp, write.value);

        if self.retention_ms > 0 {
            if let Some((&newest, _)) = series.samples.last_key_value() {
                let cutoff = newest.saturating_sub(self.retention_ms);
                series.samples = series.samples.split_off(&cutoff);
            }
        }
        Ok(())
    }

    async fn add_sorted(&self, write: &SortedAdd) -> Result<(), IndexError> {
        let mut collection = self.sorted.entry(write.log_key.clone()).or_default();
        if let Some(record_id) = &write.record_id {
            if let Some(previous) = collection.by_record.remove(record_id) {
                collection.remove_member(&previous);
            }
            collection.by_record.insert(record_id.clone(), write.member.clone());
        }
        collection.remove_member(&write.member);
        collection.members.insert((write.score, write.member.clone()));
        collection.scores.insert(write.member.clone(), write.score);
        Ok(())
    }

    async fn store_raw(&self, hash: &str, raw: &[u8]) -> Result<(), IndexError> {
        let mut log = self.raw.lock();
        if log.bytes.insert(hash.to_string(), raw.to_vec()).is_none() {
            log.order.push(hash.to_string());
        }
        Ok(())
    }

    async fn get_raw(&self, hash: &str) -> Result<Option<Vec<u8>>, IndexError> {
        Ok(self.raw.lock().bytes.get(hash).cloned())
    }

    async fn list_raw(&self, amount: Option<usize>, reverse: bool) -> Result<Vec<(String, Vec<u8>)>, IndexError> {
        let log = self.raw.lock();
        let take = amount.unwrap_or(usize::MAX);
        let pick = |hash: &String| log.bytes.get(hash).map(|b| (hash.clone(), b.clone()));
        Ok(if reverse {
            log.order.iter().rev().filter_map(pick).take(take).collect()
        } else {
            log.order.iter().filter_map(pick).take(take).collect()
        })
    }

    async fn documents(&self, log_id: &str) -> Result<Vec<Value>, IndexError> {
        Ok(self
            .documents
            .get(log_id)
            .map(|c| c.docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn stream_range(&self, log_id: &str, stream: &str, from: i64, to: i64) -> Result<Vec<StreamRecord>, IndexError> {
        if from > to {
            return Ok(Vec::new());
        }
        let key = (log_id.to_string(), stream.to_string());
        Ok(self
            .streams
            .get(&key)
            .map(|s| {
                s.range((from, 0)..=(to, u64::MAX))
                    .map(|(&(timestamp, _), message)| StreamRecord { timestamp, message: message.clone() })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn stream_last(&self, log_id: &str, stream: &str, n: usize) -> Result<Vec<StreamRecord>, IndexError> {
        let key = (log_id.to_string(), stream.to_string());
        let mut newest_first: Vec<StreamRecord> = self
            .streams
            .get(&key)
            .map(|s| {
                s.iter()
                    .rev()
                    .take(n)
                    .map(|(&(timestamp, _), message)| StreamRecord { timestamp, message: message.clone() })
                    .collect()
            })
            .unwrap_or_default();
        newest_first.reverse();
        Ok(newest_first)
    }

    async fn sorted_range(&self, log_key: &str, min: i64, max: i64) -> Result<Vec<ScoredRecord>, IndexError> {
        if min > max {
            return Ok(Vec::new());
        }
        Ok(self
            .sorted
            .get(log_key)
            .map(|c| {
                c.members
                    .range((Bound::Included((min, String::new())), Bound::Unbounded))
                    .take_while(|(score, _)| *score <= max)
                    .map(|(score, member)| ScoredRecord { timestamp: *score, record: parse_member(member) })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn series_range(&self, series: &str, from: i64, to: i64, query: &TimeSeriesQuery) -> Result<Vec<Sample>, IndexError> {
        if from > to {
            return Ok(Vec::new());
        }
        let samples: Vec<Sample> = self
            .series
            .get(series)
            .map(|s| {
                s.samples
                    .range(from..=to)
                    .map(|(&timestamp, &value)| Sample { timestamp, value })
                    .collect()
            })
            .unwrap_or_default();
        Ok(query.apply(samples))
    }

    async fn geo_position(&self, log_id: &str, label: &str, member: &str) -> Result<Option<GeoPoint>, IndexError> {
        Ok(self.position(log_id, label, member))
    }

    async fn geo_distance(&self, log_id: &str, label: &str, a: &str, b: &str, unit: GeoUnit) -> Result<Option<f64>, IndexError> {
        Ok(match (self.position(log_id, label, a), self.position(log_id, label, b)) {
            (Some(pa), Some(pb)) => Some(unit.from_meters(geo::haversine_m(pa, pb))),
            _ => None,
        })
    }

    async fn geo_hash(&self, log_id: &str, label: &str, member: &str) -> Result<Option<String>, IndexError> {
        Ok(self.position(log_id, label, member).map(geo::geohash))
    }

    async fn geo_search(
        &self,
        log_id: &str,
        label: &str,
        center: &GeoCenter,
        radius: f64,
        unit: GeoUnit,
    ) -> Result<Vec<GeoMatch>, IndexError> {
        let origin = match center {
            GeoCenter::Point(p) => *p,
            GeoCenter::Member(m) => self
                .position(log_id, label, m)
                .ok_or_else(|| IndexError::MemberNotFound(m.clone()))?,
        };
        Ok(self
            .geo
            .get(&Self::geo_key(log_id, label))
            .map(|set| geo::search(set.iter(), origin, radius, unit))
            .unwrap_or_default())
    }

    async fn clear(&self) -> Result<(), IndexError> {
        self.seen.clear();
        self.documents.clear();
        self.streams.clear();
        self.geo.clear();
        self.series.clear();
        self.sorted.clear();
        *self.raw.lock() = RawLog::default();
        Ok(())
    }
}
