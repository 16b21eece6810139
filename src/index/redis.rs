// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Stack index backend.
//!
//! Each object type gets its own key family, so type isolation is structural:
//!
//! | Type | Key | Structure |
//! |------|-----|-----------|
//! | dedup | `{p}seen:{hash}` | STRING `pending` (PX claim TTL) → `done` |
//! | document | `{p}doc:{log}:{hash}` | RedisJSON document |
//! | | `{p}docidx:{log}:{recordId}` | HASH `key`/`ts`/`hash` of the current version |
//! | | `{p}docs:{log}` | SET of live document keys |
//! | stream | `{p}stream:{log}:{name}` | ZSET, score = payload timestamp |
//! | geo | `{p}geo:{log}:{label}` | GEO set |
//! | timeseries | `{p}ts:{logKey}` | RedisTimeSeries, `DUPLICATE_POLICY BLOCK` |
//! | sortedset | `{p}zset:{logKey}` | ZSET, score = payload timestamp |
//! | raw | `{p}raw:{hash}`, `{p}raw-order` | STRING + LIST |
//!
//! Stream members are `{seq:020}:{json}` so messages sharing a timestamp keep
//! insertion order under ZSET's lexicographic tie-break.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client, Script};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::config::IndexConfig;
use crate::entry::{DocumentWrite, GeoAdd, SampleAdd, SortedAdd, StreamAppend};
use crate::resilience::retry::{is_transient, retry, RetryConfig};
use super::geo::{GeoCenter, GeoUnit};
use super::query::TimeSeriesQuery;
use super::traits::{
    DedupStore, DocumentOutcome, GeoMatch, GeoPoint, IndexBackend, IndexError, Sample, ScoredRecord, StreamRecord,
};

const SEEN_PENDING: &str = "pending";
const SEEN_DONE: &str = "done";

/// JSON.GET fan-out per pipeline when loading a log's documents.
const DOC_BATCH: usize = 200;

// KEYS: docidx, new doc key, live-doc set. ARGV: json, timestamp, hash.
// Returns 1 when stored, 0 when a newer (or equal, larger-hash) version is current.
const LATEST_WINS_LUA: &str = r#"
local cur = redis.call('HMGET', KEYS[1], 'key', 'ts', 'hash')
if cur[1] then
  local cur_ts = tonumber(cur[2])
  local new_ts = tonumber(ARGV[2])
  if cur_ts > new_ts or (cur_ts == new_ts and cur[3] >= ARGV[3]) then
    return 0
  end
  redis.call('DEL', cur[1])
  redis.call('SREM', KEYS[3], cur[1])
end
redis.call('JSON.SET', KEYS[2], '$', ARGV[1])
redis.call('HSET', KEYS[1], 'key', KEYS[2], 'ts', ARGV[2], 'hash', ARGV[3])
redis.call('SADD', KEYS[3], KEYS[2])
return 1
"#;

// KEYS: stream zset, sequence counter. ARGV: timestamp, json.
const STREAM_APPEND_LUA: &str = r#"
local seq = redis.call('INCR', KEYS[2])
redis.call('ZADD', KEYS[1], ARGV[1], string.format('%020d', seq) .. ':' .. ARGV[2])
return seq
"#;

// KEYS: zset, record index. ARGV: score, member, record id ('' = none).
const SORTED_ADD_LUA: &str = r#"
if ARGV[3] ~= '' then
  local prev = redis.call('HGET', KEYS[2], ARGV[3])
  if prev then
    redis.call('ZREM', KEYS[1], prev)
  end
  redis.call('HSET', KEYS[2], ARGV[3], ARGV[2])
end
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
return 1
"#;

// KEYS: seen marker. Deletes only an in-flight claim.
const RELEASE_CLAIM_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

// KEYS: raw blob, order list. ARGV: bytes, hash.
const STORE_RAW_LUA: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  redis.call('RPUSH', KEYS[2], ARGV[2])
end
return 1
"#;

pub struct RedisIndex {
    connection: ConnectionManager,
    prefix: String,
    claim_ttl_ms: u64,
    /// 0 keeps samples forever
    retention_ms: u64,
    latest_wins: Script,
    stream_append: Script,
    sorted_add: Script,
    release_claim: Script,
    store_raw: Script,
}

fn backend(e: redis::RedisError) -> IndexError {
    IndexError::Backend(e.to_string())
}

impl RedisIndex {
    /// Connect using the index section of the node config.
    ///
    /// ```rust,no_run
    /// # use nodeweave::{IndexConfig, index::redis::RedisIndex};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = IndexConfig { redis_url: Some("redis://localhost:6379".into()), ..Default::default() };
    /// let index = RedisIndex::connect("redis://localhost:6379", &config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(connection_string: &str, config: &IndexConfig) -> Result<Self, IndexError> {
        let client = Client::open(connection_string).map_err(backend)?;

        // Startup config: fail fast on a bad URL instead of hanging
        let connection = retry("redis_connect", &RetryConfig::startup(), is_transient, || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(backend)?;

        Ok(Self {
            connection,
            prefix: config.key_prefix.clone(),
            claim_ttl_ms: config.claim_ttl_ms.max(1),
            retention_ms: config.timeseries_retention_ms,
            latest_wins: Script::new(LATEST_WINS_LUA),
            stream_append: Script::new(STREAM_APPEND_LUA),
            sorted_add: Script::new(SORTED_ADD_LUA),
            release_claim: Script::new(RELEASE_CLAIM_LUA),
            store_raw: Script::new(STORE_RAW_LUA),
        })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    fn key(&self, parts: &[&str]) -> String {
        let mut key = self.prefix.clone();
        key.push_str(&parts.join(":"));
        key
    }

    fn seen_key(&self, hash: &str) -> String {
        self.key(&["seen", hash])
    }

    fn geo_key(&self, log_id: &str, label: &str) -> String {
        self.key(&["geo", log_id, label])
    }

    async fn ensure_series(&self, key: &str, write: &SampleAdd) -> Result<(), IndexError> {
        let mut conn = self.connection.clone();
        let mut create = cmd("TS.CREATE");
        create
            .arg(key)
            .arg("RETENTION")
            .arg(self.retention_ms)
            .arg("ENCODING")
            .arg("UNCOMPRESSED")
            .arg("DUPLICATE_POLICY")
            .arg("BLOCK");
        if !write.labels.is_empty() {
            create.arg("LABELS");
            for (name, value) in &write.labels {
                create.arg(name).arg(value);
            }
        }
        match create.query_async::<()>(&mut conn).await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("already exists") => Ok(()),
            Err(e) => Err(backend(e)),
        }
    }

    async fn position_of(&self, key: &str, member: &str) -> Result<Option<GeoPoint>, IndexError> {
        let conn = self.connection.clone();
        let positions: Vec<Option<(f64, f64)>> = retry("redis_geopos", &RetryConfig::query(), is_transient, || {
            let mut conn = conn.clone();
            async move { cmd("GEOPOS").arg(key).arg(member).query_async(&mut conn).await }
        })
        .await
        .map_err(backend)?;
        Ok(positions
            .into_iter()
            .next()
            .flatten()
            .map(|(longitude, latitude)| GeoPoint { longitude, latitude }))
    }
}

fn parse_json(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Strip the `{seq}:` ordering prefix from a stream member.
fn stream_record(member: &str, score: f64) -> StreamRecord {
    let json = member.split_once(':').map_or(member, |(_, rest)| rest);
    StreamRecord { timestamp: score as i64, message: parse_json(json) }
}

#[async_trait]
impl DedupStore for RedisIndex {
    async fn try_claim(&self, hash: &str) -> Result<bool, IndexError> {
        let mut conn = self.connection.clone();
        let claimed: Option<String> = cmd("SET")
            .arg(self.seen_key(hash))
            .arg(SEEN_PENDING)
            .arg("NX")
            .arg("PX")
            .arg(self.claim_ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(claimed.is_some())
    }

    async fn mark_processed(&self, hash: &str) -> Result<(), IndexError> {
        let conn = self.connection.clone();
        let key = self.seen_key(hash);
        retry("redis_mark_processed", &RetryConfig::query(), is_transient, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move { cmd("SET").arg(&key).arg(SEEN_DONE).query_async::<()>(&mut conn).await }
        })
        .await
        .map_err(backend)
    }

    async fn release_claim(&self, hash: &str) -> Result<(), IndexError> {
        let mut conn = self.connection.clone();
        let _: i64 = self
            .release_claim
            .key(self.seen_key(hash))
            .arg(SEEN_PENDING)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn is_processed(&self, hash: &str) -> Result<bool, IndexError> {
        let mut conn = self.connection.clone();
        let state: Option<String> = cmd("GET")
            .arg(self.seen_key(hash))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(state.as_deref() == Some(SEEN_DONE))
    }
}

#[async_trait]
impl IndexBackend for RedisIndex {
    #[instrument(skip(self, write), fields(log_id = %write.log_id, hash = %write.hash))]
    async fn write_document(&self, write: &DocumentWrite) -> Result<DocumentOutcome, IndexError> {
        let mut conn = self.connection.clone();
        let doc_key = self.key(&["doc", &write.log_id, &write.hash]);
        let live_key = self.key(&["docs", &write.log_id]);
        let json = serde_json::to_string(&write.document)
            .map_err(|e| IndexError::InvalidPayload(e.to_string()))?;

        let Some(record_id) = &write.record_id else {
            let mut pipeline = pipe();
            pipeline
                .atomic()
                .cmd("JSON.SET").arg(&doc_key).arg("$").arg(&json).ignore()
                .cmd("SADD").arg(&live_key).arg(&doc_key).ignore();
            pipeline.query_async::<()>(&mut conn).await.map_err(backend)?;
            return Ok(DocumentOutcome::Stored);
        };

        let stored: i64 = self
            .latest_wins
            .key(self.key(&["docidx", &write.log_id, record_id]))
            .key(&doc_key)
            .key(&live_key)
            .arg(&json)
            .arg(write.timestamp)
            .arg(&write.hash)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        if stored == 1 {
            Ok(DocumentOutcome::Stored)
        } else {
            debug!(record_id = %record_id, "Newer document version already indexed");
            Ok(DocumentOutcome::Superseded)
        }
    }

    // Not retried: a lost reply would append twice. Redelivery retries instead.
    async fn append_stream(&self, write: &StreamAppend) -> Result<(), IndexError> {
        let mut conn = self.connection.clone();
        let json = serde_json::to_string(&write.message)
            .map_err(|e| IndexError::InvalidPayload(e.to_string()))?;
        let _: i64 = self
            .stream_append
            .key(self.key(&["stream", &write.log_id, &write.stream_name]))
            .key(self.key(&["stream-seq", &write.log_id, &write.stream_name]))
            .arg(write.timestamp)
            .arg(json)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn add_geo(&self, write: &GeoAdd) -> Result<(), IndexError> {
        let conn = self.connection.clone();
        let key = self.geo_key(&write.log_id, &write.label);
        retry("redis_geoadd", &RetryConfig::query(), is_transient, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                cmd("GEOADD")
                    .arg(&key)
                    .arg(write.longitude)
                    .arg(write.latitude)
                    .arg(&write.member)
                    .query_async::<()>(&mut conn)
                    .await
            }
        })
        .await
        .map_err(backend)
    }

    // Not retried: a lost reply would come back as a duplicate sample.
    async fn add_sample(&self, write: &SampleAdd) -> Result<(), IndexError> {
        let key = self.key(&["ts", &write.series]);
        self.ensure_series(&key, write).await?;

        let mut conn = self.connection.clone();
        let added = cmd("TS.ADD")
            .arg(&key)
            .arg(write.timestamp)
            .arg(write.value)
            .arg("ON_DUPLICATE")
            .arg("BLOCK")
            .query_async::<i64>(&mut conn)
            .await;

        match added {
            Ok(_) => Ok(()),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("DUPLICATE_POLICY") || msg.contains("update is not supported") {
                    Err(IndexError::DuplicateSample {
                        series: write.series.clone(),
                        timestamp: write.timestamp,
                    })
                } else if msg.contains("older than retention") {
                    Err(IndexError::InvalidPayload(msg))
                } else {
                    Err(backend(e))
                }
            }
        }
    }

    async fn add_sorted(&self, write: &SortedAdd) -> Result<(), IndexError> {
        let mut conn = self.connection.clone();
        let _: i64 = self
            .sorted_add
            .key(self.key(&["zset", &write.log_key]))
            .key(self.key(&["zset-rec", &write.log_key]))
            .arg(write.score)
            .arg(&write.member)
            .arg(write.record_id.as_deref().unwrap_or(""))
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn store_raw(&self, hash: &str, raw: &[u8]) -> Result<(), IndexError> {
        let mut conn = self.connection.clone();
        let _: i64 = self
            .store_raw
            .key(self.key(&["raw", hash]))
            .key(self.key(&["raw-order"]))
            .arg(raw)
            .arg(hash)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_raw(&self, hash: &str) -> Result<Option<Vec<u8>>, IndexError> {
        let conn = self.connection.clone();
        let key = self.key(&["raw", hash]);
        retry("redis_get_raw", &RetryConfig::query(), is_transient, || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move { cmd("GET").arg(&key).query_async::<Option<Vec<u8>>>(&mut conn).await }
        })
        .await
        .map_err(backend)
    }

    async fn list_raw(&self, amount: Option<usize>, reverse: bool) -> Result<Vec<(String, Vec<u8>)>, IndexError> {
        if amount == Some(0) {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let n = amount.map(|a| a as i64);
        let (start, stop) = match (n, reverse) {
            (None, _) => (0, -1),
            (Some(n), false) => (0, n - 1),
            (Some(n), true) => (-n, -1),
        };
        let mut hashes: Vec<String> = cmd("LRANGE")
            .arg(self.key(&["raw-order"]))
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        if reverse {
            hashes.reverse();
        }
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipeline = pipe();
        for hash in &hashes {
            pipeline.cmd("GET").arg(self.key(&["raw", hash]));
        }
        let blobs: Vec<Option<Vec<u8>>> = pipeline.query_async(&mut conn).await.map_err(backend)?;
        Ok(hashes
            .into_iter()
            .zip(blobs)
            .filter_map(|(hash, blob)| blob.map(|b| (hash, b)))
            .collect())
    }

    async fn documents(&self, log_id: &str) -> Result<Vec<Value>, IndexError> {
        let conn = self.connection.clone();
        let live_key = self.key(&["docs", log_id]);
        let keys: Vec<String> = retry("redis_smembers", &RetryConfig::query(), is_transient, || {
            let mut conn = conn.clone();
            let key = live_key.clone();
            async move { cmd("SMEMBERS").arg(&key).query_async(&mut conn).await }
        })
        .await
        .map_err(backend)?;

        let mut docs = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(DOC_BATCH) {
            let mut pipeline = pipe();
            for key in chunk {
                pipeline.cmd("JSON.GET").arg(key);
            }
            let mut conn = self.connection.clone();
            let raw: Vec<Option<String>> = pipeline.query_async(&mut conn).await.map_err(backend)?;
            docs.extend(raw.into_iter().flatten().map(|s| parse_json(&s)));
        }
        Ok(docs)
    }

    async fn stream_range(&self, log_id: &str, stream: &str, from: i64, to: i64) -> Result<Vec<StreamRecord>, IndexError> {
        if from > to {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let members: Vec<(String, f64)> = cmd("ZRANGEBYSCORE")
            .arg(self.key(&["stream", log_id, stream]))
            .arg(from)
            .arg(to)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(members.iter().map(|(m, score)| stream_record(m, *score)).collect())
    }

    async fn stream_last(&self, log_id: &str, stream: &str, n: usize) -> Result<Vec<StreamRecord>, IndexError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let members: Vec<(String, f64)> = cmd("ZREVRANGEBYSCORE")
            .arg(self.key(&["stream", log_id, stream]))
            .arg("+inf")
            .arg("-inf")
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(n)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(members.iter().rev().map(|(m, score)| stream_record(m, *score)).collect())
    }

    async fn sorted_range(&self, log_key: &str, min: i64, max: i64) -> Result<Vec<ScoredRecord>, IndexError> {
        if min > max {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let members: Vec<(String, f64)> = cmd("ZRANGEBYSCORE")
            .arg(self.key(&["zset", log_key]))
            .arg(min)
            .arg(max)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(members
            .into_iter()
            .map(|(member, score)| ScoredRecord { timestamp: score as i64, record: parse_json(&member) })
            .collect())
    }

    async fn series_range(&self, series: &str, from: i64, to: i64, query: &TimeSeriesQuery) -> Result<Vec<Sample>, IndexError> {
        if from > to || query.filter_timestamps.as_ref().is_some_and(|ts| ts.is_empty()) {
            return Ok(Vec::new());
        }
        let mut range = cmd("TS.RANGE");
        range.arg(self.key(&["ts", series])).arg(from).arg(to);
        if let Some(ref timestamps) = query.filter_timestamps {
            range.arg("FILTER_BY_TS");
            for ts in timestamps {
                range.arg(*ts);
            }
        }
        if let Some((min, max)) = query.filter_value_range {
            range.arg("FILTER_BY_VALUE").arg(min).arg(max);
        }
        if let Some(limit) = query.limit {
            range.arg("COUNT").arg(limit);
        }
        if let Some(agg) = query.aggregation {
            range.arg("AGGREGATION").arg(agg.kind.as_str()).arg(agg.bucket_ms);
        }

        let mut conn = self.connection.clone();
        match range.query_async::<Vec<(i64, f64)>>(&mut conn).await {
            Ok(points) => Ok(points
                .into_iter()
                .map(|(timestamp, value)| Sample { timestamp, value })
                .collect()),
            Err(e) if e.to_string().contains("does not exist") => Ok(Vec::new()),
            Err(e) => Err(backend(e)),
        }
    }

    async fn geo_position(&self, log_id: &str, label: &str, member: &str) -> Result<Option<GeoPoint>, IndexError> {
        self.position_of(&self.geo_key(log_id, label), member).await
    }

    async fn geo_distance(&self, log_id: &str, label: &str, a: &str, b: &str, unit: GeoUnit) -> Result<Option<f64>, IndexError> {
        let mut conn = self.connection.clone();
        cmd("GEODIST")
            .arg(self.geo_key(log_id, label))
            .arg(a)
            .arg(b)
            .arg(unit.as_str())
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }

    async fn geo_hash(&self, log_id: &str, label: &str, member: &str) -> Result<Option<String>, IndexError> {
        let mut conn = self.connection.clone();
        let hashes: Vec<Option<String>> = cmd("GEOHASH")
            .arg(self.geo_key(log_id, label))
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(hashes.into_iter().next().flatten())
    }

    async fn geo_search(
        &self,
        log_id: &str,
        label: &str,
        center: &GeoCenter,
        radius: f64,
        unit: GeoUnit,
    ) -> Result<Vec<GeoMatch>, IndexError> {
        let key = self.geo_key(log_id, label);
        let origin = match center {
            GeoCenter::Point(p) => *p,
            GeoCenter::Member(m) => self
                .position_of(&key, m)
                .await?
                .ok_or_else(|| IndexError::MemberNotFound(m.clone()))?,
        };

        let mut conn = self.connection.clone();
        let found: Vec<(String, f64, (f64, f64))> = cmd("GEOSEARCH")
            .arg(&key)
            .arg("FROMLONLAT")
            .arg(origin.longitude)
            .arg(origin.latitude)
            .arg("BYRADIUS")
            .arg(radius)
            .arg(unit.as_str())
            .arg("ASC")
            .arg("WITHCOORD")
            .arg("WITHDIST")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        Ok(found
            .into_iter()
            .map(|(member, distance, (longitude, latitude))| GeoMatch {
                member,
                distance,
                position: GeoPoint { longitude, latitude },
            })
            .collect())
    }

    async fn clear(&self) -> Result<(), IndexError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", self.prefix);
        let mut cursor = 0u64;

        loop {
            let (next, batch): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(|e| IndexError::Backend(format!("Failed to scan index keys: {}", e)))?;

            if !batch.is_empty() {
                cmd("DEL").arg(&batch).query_async::<()>(&mut conn).await.map_err(backend)?;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(())
    }
}
