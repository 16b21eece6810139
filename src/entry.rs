// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Log entry decoding.
//!
//! The replicated log hands the storage engine opaque entry bytes. This module
//! turns them into a [`LogEntry`] and, from there, into the typed
//! [`IndexWrite`] that one of the five index writers consumes.
//!
//! # Wire shape
//!
//! ```json
//! {
//!   "hash": "zdpu...",                 // engine-internal, stripped
//!   "bytes": "...",                    // engine-internal, stripped
//!   "id": "/orbitdb/zdpuLogAddress",
//!   "payload": {
//!     "op": "PUT",
//!     "key": "rec-1",
//!     "value": {
//!       "_id": "rec-1",
//!       "publicKey": "ab12...",
//!       "data": {"name": "Alice"},
//!       "sig": "...",
//!       "timestamp": 1767084657058,
//!       "objectType": "document"
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Fields owned by the log engine that never reach the index.
const ENGINE_FIELDS: [&str; 2] = ["hash", "bytes"];

/// Redis rejects latitudes outside the web-mercator band; so do we.
pub const MAX_LATITUDE: f64 = 85.051_128_78;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("entry is not valid JSON: {0}")]
    Malformed(String),
    #[error("entry has no payload value")]
    MissingValue,
    #[error("{object_type} entry is missing field '{field}'")]
    MissingField { object_type: ObjectType, field: &'static str },
    #[error("{object_type} entry field '{field}' is invalid: {reason}")]
    InvalidField {
        object_type: ObjectType,
        field: &'static str,
        reason: String,
    },
}

/// Which index structure an entry is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "&'static str")]
pub enum ObjectType {
    #[default]
    Document,
    Stream,
    Geo,
    TimeSeries,
    SortedSet,
}

impl ObjectType {
    pub const ALL: [ObjectType; 5] = [
        ObjectType::Document,
        ObjectType::Stream,
        ObjectType::Geo,
        ObjectType::TimeSeries,
        ObjectType::SortedSet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Stream => "stream",
            Self::Geo => "geo",
            Self::TimeSeries => "timeseries",
            Self::SortedSet => "sortedset",
        }
    }
}

impl From<String> for ObjectType {
    /// Unknown tags fall back to `document`.
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "stream" => Self::Stream,
            "geo" => Self::Geo,
            "timeseries" | "ts" => Self::TimeSeries,
            "sortedset" => Self::SortedSet,
            _ => Self::Document,
        }
    }
}

impl From<ObjectType> for &'static str {
    fn from(t: ObjectType) -> Self {
        t.as_str()
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The signed record carried in an entry's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryValue {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(rename = "publicKey", default)]
    pub public_key: String,
    #[serde(default)]
    pub data: Value,
    #[serde(rename = "sig", alias = "signature", default)]
    pub signature: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "objectType", default)]
    pub object_type: ObjectType,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct EntryPayload {
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    key: Option<String>,
    value: Option<EntryValue>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireEntry {
    id: String,
    payload: EntryPayload,
}

/// A decoded log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Content address, as supplied by the log engine alongside the bytes
    pub hash: String,
    /// Which replicated log this entry belongs to
    pub log_id: String,
    pub op: Option<String>,
    pub key: Option<String>,
    pub value: EntryValue,
}

impl LogEntry {
    pub fn object_type(&self) -> ObjectType {
        self.value.object_type
    }

    /// Key segment of the log address, used for series and sorted-set keys.
    pub fn log_key(&self) -> &str {
        log_key(&self.log_id)
    }

    /// The signed value as stored by document and sorted-set writers.
    pub fn value_json(&self) -> Value {
        serde_json::to_value(&self.value).unwrap_or(Value::Null)
    }

    /// Extract the type-specific write this entry requests.
    pub fn to_index_write(&self) -> Result<IndexWrite, DecodeError> {
        let object_type = self.object_type();
        let data = &self.value.data;
        let write = match object_type {
            ObjectType::Document => IndexWrite::Document(DocumentWrite {
                log_id: self.log_id.clone(),
                hash: self.hash.clone(),
                record_id: self.value.record_id.clone(),
                timestamp: self.value.timestamp,
                document: self.value_json(),
            }),
            ObjectType::Stream => IndexWrite::Stream(StreamAppend {
                log_id: self.log_id.clone(),
                stream_name: required_str(data, object_type, "streamName")?,
                timestamp: self.value.timestamp,
                message: self.value_json(),
            }),
            ObjectType::Geo => {
                let longitude = required_f64(data, object_type, "longitude")?;
                let latitude = required_f64(data, object_type, "latitude")?;
                if !(-180.0..=180.0).contains(&longitude) {
                    return Err(DecodeError::InvalidField {
                        object_type,
                        field: "longitude",
                        reason: format!("{} outside [-180, 180]", longitude),
                    });
                }
                if !(-MAX_LATITUDE..=MAX_LATITUDE).contains(&latitude) {
                    return Err(DecodeError::InvalidField {
                        object_type,
                        field: "latitude",
                        reason: format!("{} outside [-{MAX_LATITUDE}, {MAX_LATITUDE}]", latitude),
                    });
                }
                IndexWrite::Geo(GeoAdd {
                    log_id: self.log_id.clone(),
                    label: required_str(data, object_type, "locationLabel")?,
                    member: required_str(data, object_type, "member")?,
                    longitude,
                    latitude,
                })
            }
            ObjectType::TimeSeries => IndexWrite::Sample(SampleAdd {
                series: self.log_key().to_string(),
                timestamp: self.value.timestamp,
                value: required_f64(data, object_type, "value")?,
                labels: labels(data, object_type)?,
            }),
            ObjectType::SortedSet => IndexWrite::Sorted(SortedAdd {
                log_key: self.log_key().to_string(),
                record_id: self.value.record_id.clone(),
                score: self.value.timestamp,
                member: self.value_json().to_string(),
            }),
        };
        Ok(write)
    }
}

/// Decode entry bytes delivered by the log engine.
///
/// Engine-internal fields are stripped before the residual payload is parsed.
pub fn decode(hash: &str, raw: &[u8]) -> Result<LogEntry, DecodeError> {
    let mut doc: Map<String, Value> =
        serde_json::from_slice(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    for field in ENGINE_FIELDS {
        doc.remove(field);
    }

    let wire: WireEntry = serde_json::from_value(Value::Object(doc))
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let value = wire.payload.value.ok_or(DecodeError::MissingValue)?;

    Ok(LogEntry {
        hash: hash.to_string(),
        log_id: wire.id,
        op: wire.payload.op,
        key: wire.payload.key,
        value,
    })
}

/// `/orbitdb/zdpuX` → `zdpuX`; ids without that shape are used whole.
pub fn log_key(log_id: &str) -> &str {
    let mut parts = log_id.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(""), Some(_engine), Some(key)) if !key.is_empty() => key,
        _ => log_id,
    }
}

/// A write routed to exactly one index structure.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexWrite {
    Document(DocumentWrite),
    Stream(StreamAppend),
    Geo(GeoAdd),
    Sample(SampleAdd),
    Sorted(SortedAdd),
}

impl IndexWrite {
    pub fn object_type(&self) -> ObjectType {
        match self {
            Self::Document(_) => ObjectType::Document,
            Self::Stream(_) => ObjectType::Stream,
            Self::Geo(_) => ObjectType::Geo,
            Self::Sample(_) => ObjectType::TimeSeries,
            Self::Sorted(_) => ObjectType::SortedSet,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWrite {
    pub log_id: String,
    pub hash: String,
    pub record_id: Option<String>,
    pub timestamp: i64,
    pub document: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamAppend {
    pub log_id: String,
    pub stream_name: String,
    pub timestamp: i64,
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoAdd {
    pub log_id: String,
    pub label: String,
    pub member: String,
    pub longitude: f64,
    pub latitude: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleAdd {
    pub series: String,
    pub timestamp: i64,
    pub value: f64,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortedAdd {
    pub log_key: String,
    pub record_id: Option<String>,
    pub score: i64,
    /// Serialized record; the sorted-set member
    pub member: String,
}

fn required_str(data: &Value, object_type: ObjectType, field: &'static str) -> Result<String, DecodeError> {
    match data.get(field) {
        None | Some(Value::Null) => Err(DecodeError::MissingField { object_type, field }),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(other) => Err(DecodeError::InvalidField {
            object_type,
            field,
            reason: format!("expected non-empty string, got {}", other),
        }),
    }
}

fn required_f64(data: &Value, object_type: ObjectType, field: &'static str) -> Result<f64, DecodeError> {
    match data.get(field) {
        None | Some(Value::Null) => Err(DecodeError::MissingField { object_type, field }),
        Some(Value::Number(n)) => n.as_f64().ok_or_else(|| DecodeError::InvalidField {
            object_type,
            field,
            reason: format!("{} is not representable as f64", n),
        }),
        // Numeric strings show up from clients that stringify everything
        Some(Value::String(s)) => s.trim().parse().map_err(|_| DecodeError::InvalidField {
            object_type,
            field,
            reason: format!("'{}' is not a number", s),
        }),
        Some(other) => Err(DecodeError::InvalidField {
            object_type,
            field,
            reason: format!("expected number, got {}", other),
        }),
    }
}

fn labels(data: &Value, object_type: ObjectType) -> Result<BTreeMap<String, String>, DecodeError> {
    let Some(raw) = data.get("labels") else {
        return Ok(BTreeMap::new());
    };
    let obj = match raw {
        Value::Null => return Ok(BTreeMap::new()),
        Value::Object(obj) => obj,
        other => {
            return Err(DecodeError::InvalidField {
                object_type,
                field: "labels",
                reason: format!("expected object, got {}", other),
            })
        }
    };
    obj.iter()
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                Value::Number(_) | Value::Bool(_) => v.to_string(),
                other => {
                    return Err(DecodeError::InvalidField {
                        object_type,
                        field: "labels",
                        reason: format!("label '{}' has non-scalar value {}", k, other),
                    })
                }
            };
            Ok((k.clone(), value))
        })
        .collect()
}
