// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query predicates and post-processing shared by every backend.
//!
//! Document queries are evaluated in-process on the live documents of a log:
//! filter (AND of all conditions), then sort, then paginate.
//!
//! ```
//! use nodeweave::index::query::{Condition, CompareOp, DocumentQueryOptions, SortOrder, run_document_query};
//! use serde_json::json;
//!
//! let docs = vec![
//!     json!({"_id": "a", "data": {"age": 31}}),
//!     json!({"_id": "b", "data": {"age": 17}}),
//!     json!({"_id": "c", "data": {"age": 45}}),
//! ];
//! let adults = run_document_query(
//!     docs,
//!     &[Condition::new("data.age", CompareOp::Gte, json!(18))],
//!     &DocumentQueryOptions { sort_by: Some("data.age".into()), sort_order: SortOrder::Desc, ..Default::default() },
//! );
//! assert_eq!(adults[0]["_id"], "c");
//! assert_eq!(adults.len(), 2);
//! ```

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::traits::{IndexError, Sample};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    Ne,
}

impl CompareOp {
    pub fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "eq" | "=" | "==" => Self::Eq,
            "gt" | ">" => Self::Gt,
            "gte" | ">=" => Self::Gte,
            "lt" | "<" => Self::Lt,
            "lte" | "<=" => Self::Lte,
            "ne" | "!=" => Self::Ne,
            _ => return None,
        })
    }
}

/// `field op value`, where `field` is a dotted path into the stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: CompareOp,
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: CompareOp, value: Value) -> Self {
        Self { field: field.into(), op, value }
    }

    /// Parse the API layer's condition object.
    ///
    /// `{"status": "open", "data.age": {"gte": 18, "lt": 65}}` becomes three
    /// conditions. Scalars mean equality.
    pub fn from_json(conditions: &Value) -> Result<Vec<Condition>, IndexError> {
        let obj = match conditions {
            Value::Null => return Ok(Vec::new()),
            Value::Object(obj) => obj,
            other => {
                return Err(IndexError::InvalidPayload(format!(
                    "conditions must be an object, got {}",
                    other
                )))
            }
        };
        let mut out = Vec::new();
        for (field, spec) in obj {
            match spec {
                Value::Object(ops) => {
                    for (op, value) in ops {
                        let op = CompareOp::parse(op).ok_or_else(|| {
                            IndexError::InvalidPayload(format!("unknown operator '{}' on '{}'", op, field))
                        })?;
                        out.push(Condition::new(field.clone(), op, value.clone()));
                    }
                }
                scalar => out.push(Condition::new(field.clone(), CompareOp::Eq, scalar.clone())),
            }
        }
        Ok(out)
    }

    /// Missing fields and mismatched types never match, whatever the operator.
    pub fn matches(&self, doc: &Value) -> bool {
        let Some(actual) = lookup(doc, &self.field) else {
            return false;
        };
        if actual.is_null() || self.value.is_null() {
            return false;
        }
        match compare_same_kind(actual, &self.value) {
            Some(ord) => match self.op {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::Ne => ord != Ordering::Equal,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Gte => ord != Ordering::Less,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Lte => ord != Ordering::Greater,
            },
            // Arrays and objects only support (in)equality
            None if same_kind(actual, &self.value) => match self.op {
                CompareOp::Eq => actual == &self.value,
                CompareOp::Ne => actual != &self.value,
                _ => false,
            },
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentQueryOptions {
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_order: SortOrder,
}

/// Filter, sort, then paginate.
pub fn run_document_query(docs: Vec<Value>, conditions: &[Condition], options: &DocumentQueryOptions) -> Vec<Value> {
    let mut matched: Vec<Value> = docs
        .into_iter()
        .filter(|doc| conditions.iter().all(|c| c.matches(doc)))
        .collect();

    if let Some(ref field) = options.sort_by {
        matched.sort_by(|a, b| sort_cmp(lookup(a, field), lookup(b, field), options.sort_order));
    }

    let limit = options.limit.unwrap_or(usize::MAX);
    matched.into_iter().skip(options.offset).take(limit).collect()
}

/// Resolve a dotted path (`data.address.city`).
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn same_kind(a: &Value, b: &Value) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

fn compare_same_kind(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Nulls (and missing values) sort last in both directions. Other values
/// group by kind (numbers, strings, bools, arrays, objects) and compare within
/// their kind, so mixed-type fields still sort consistently.
fn sort_cmp(a: Option<&Value>, b: Option<&Value>, order: SortOrder) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    let (a, b) = match (a, b) {
        (None, None) => return Ordering::Equal,
        (None, Some(_)) => return Ordering::Greater,
        (Some(_), None) => return Ordering::Less,
        (Some(a), Some(b)) => (a, b),
    };

    let ord = kind_rank(a).cmp(&kind_rank(b)).then_with(|| match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    });
    match order {
        SortOrder::Asc => ord,
        SortOrder::Desc => ord.reverse(),
    }
}

fn kind_rank(v: &Value) -> u8 {
    match v {
        Value::Number(_) => 0,
        Value::String(_) => 1,
        Value::Bool(_) => 2,
        Value::Array(_) => 3,
        Value::Object(_) => 4,
        Value::Null => 5,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Time series
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationKind {
    Avg,
    Sum,
    Min,
    Max,
    Range,
    Count,
    First,
    Last,
}

impl AggregationKind {
    /// RedisTimeSeries aggregator name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Avg => "avg",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Range => "range",
            Self::Count => "count",
            Self::First => "first",
            Self::Last => "last",
        }
    }

    fn fold(&self, values: &[f64]) -> f64 {
        match self {
            Self::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Self::Sum => values.iter().sum(),
            Self::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::Range => {
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                max - min
            }
            Self::Count => values.len() as f64,
            Self::First => values.first().copied().unwrap_or(f64::NAN),
            Self::Last => values.last().copied().unwrap_or(f64::NAN),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub kind: AggregationKind,
    /// Bucket width; buckets are aligned to epoch 0
    pub bucket_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesQuery {
    pub aggregation: Option<Aggregation>,
    pub limit: Option<usize>,
    /// Keep only samples at exactly these timestamps
    pub filter_timestamps: Option<Vec<i64>>,
    /// Inclusive `(min, max)` value filter
    pub filter_value_range: Option<(f64, f64)>,
}

impl TimeSeriesQuery {
    pub fn validate(&self) -> Result<(), IndexError> {
        if let Some(agg) = self.aggregation {
            if agg.bucket_ms <= 0 {
                return Err(IndexError::InvalidPayload(format!(
                    "aggregation bucket must be positive, got {}",
                    agg.bucket_ms
                )));
            }
        }
        if let Some((min, max)) = self.filter_value_range {
            if min > max {
                return Err(IndexError::InvalidPayload(format!(
                    "value filter min {} exceeds max {}",
                    min, max
                )));
            }
        }
        Ok(())
    }

    /// Apply filters, aggregation and limit to time-ordered samples.
    pub fn apply(&self, samples: impl IntoIterator<Item = Sample>) -> Vec<Sample> {
        let filtered = samples.into_iter().filter(|s| {
            let ts_ok = self
                .filter_timestamps
                .as_ref()
                .map_or(true, |allowed| allowed.contains(&s.timestamp));
            let value_ok = self
                .filter_value_range
                .map_or(true, |(min, max)| s.value >= min && s.value <= max);
            ts_ok && value_ok
        });

        let mut out: Vec<Sample> = match self.aggregation {
            None => filtered.collect(),
            Some(agg) => {
                let mut buckets: Vec<(i64, Vec<f64>)> = Vec::new();
                for s in filtered {
                    let start = s.timestamp.div_euclid(agg.bucket_ms).saturating_mul(agg.bucket_ms);
                    match buckets.last_mut() {
                        Some((bucket, values)) if *bucket == start => values.push(s.value),
                        _ => buckets.push((start, vec![s.value])),
                    }
                }
                buckets
                    .into_iter()
                    .map(|(timestamp, values)| Sample { timestamp, value: agg.kind.fold(&values) })
                    .collect()
            }
        };

        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn people() -> Vec<Value> {
        vec![
            json!({"_id": "1", "data": {"name": "carol", "age": 40}}),
            json!({"_id": "2", "data": {"name": "alice", "age": null}}),
            json!({"_id": "3", "data": {"name": "bob", "age": 25}}),
            json!({"_id": "4", "data": {"name": "dave"}}),
        ]
    }

    fn ids(docs: &[Value]) -> Vec<&str> {
        docs.iter().map(|d| d["_id"].as_str().unwrap()).collect()
    }

    #[test]
    fn test_conditions_are_anded() {
        let conds = vec![
            Condition::new("data.age", CompareOp::Gt, json!(20)),
            Condition::new("data.name", CompareOp::Ne, json!("bob")),
        ];
        let out = run_document_query(people(), &conds, &DocumentQueryOptions::default());
        assert_eq!(ids(&out), vec!["1"]);
    }

    #[test]
    fn test_missing_field_never_matches() {
        let conds = vec![Condition::new("data.age", CompareOp::Ne, json!(40))];
        let out = run_document_query(people(), &conds, &DocumentQueryOptions::default());
        assert_eq!(ids(&out), vec!["3"]);
    }

    #[test]
    fn test_mixed_types_do_not_match() {
        let cond = Condition::new("data.age", CompareOp::Eq, json!("40"));
        assert!(!cond.matches(&people()[0]));
    }

    #[test]
    fn test_nulls_sort_last_both_directions() {
        for order in [SortOrder::Asc, SortOrder::Desc] {
            let opts = DocumentQueryOptions { sort_by: Some("data.age".into()), sort_order: order, ..Default::default() };
            let out = run_document_query(people(), &[], &opts);
            let got = ids(&out);
            assert_eq!(&got[2..], &["2", "4"]);
            match order {
                SortOrder::Asc => assert_eq!(&got[..2], &["3", "1"]),
                SortOrder::Desc => assert_eq!(&got[..2], &["1", "3"]),
            }
        }
    }

    #[test]
    fn test_mixed_kinds_sort_by_kind_then_value() {
        let docs = vec![
            json!({"_id": "a", "v": "10"}),
            json!({"_id": "b", "v": 9.5}),
            json!({"_id": "c", "v": "9"}),
            json!({"_id": "d", "v": true}),
            json!({"_id": "e", "v": 2}),
            json!({"_id": "f"}),
        ];
        let opts = DocumentQueryOptions { sort_by: Some("v".into()), ..Default::default() };
        let out = run_document_query(docs, &[], &opts);
        assert_eq!(ids(&out), vec!["e", "b", "a", "c", "d", "f"]);
    }

    #[test]
    fn test_pagination_after_sort() {
        let opts = DocumentQueryOptions {
            sort_by: Some("data.name".into()),
            offset: 1,
            limit: Some(2),
            ..Default::default()
        };
        let out = run_document_query(people(), &[], &opts);
        assert_eq!(ids(&out), vec!["3", "1"]);
    }

    #[test]
    fn test_conditions_from_json() {
        let conds = Condition::from_json(&json!({"data.age": {"gte": 18, "lt": 65}, "data.name": "bob"})).unwrap();
        assert_eq!(conds.len(), 3);
        let out = run_document_query(people(), &conds, &DocumentQueryOptions::default());
        assert_eq!(ids(&out), vec!["3"]);

        assert!(Condition::from_json(&json!({"x": {"like": 1}})).is_err());
        assert!(Condition::from_json(&json!([1])).is_err());
    }

    fn samples(points: &[(i64, f64)]) -> Vec<Sample> {
        points.iter().map(|&(timestamp, value)| Sample { timestamp, value }).collect()
    }

    #[test]
    fn test_series_aggregation_buckets() {
        let query = TimeSeriesQuery {
            aggregation: Some(Aggregation { kind: AggregationKind::Avg, bucket_ms: 10 }),
            ..Default::default()
        };
        let out = query.apply(samples(&[(1, 1.0), (5, 3.0), (12, 10.0), (25, 4.0), (29, 6.0)]));
        assert_eq!(out, samples(&[(0, 2.0), (10, 10.0), (20, 5.0)]));

        let range = TimeSeriesQuery {
            aggregation: Some(Aggregation { kind: AggregationKind::Range, bucket_ms: 100 }),
            ..Default::default()
        };
        assert_eq!(range.apply(samples(&[(1, 1.0), (5, 3.0), (12, 10.0)])), samples(&[(0, 9.0)]));
    }

    #[test]
    fn test_bucket_start_near_min_timestamp() {
        let query = TimeSeriesQuery {
            aggregation: Some(Aggregation { kind: AggregationKind::Count, bucket_ms: 10 }),
            ..Default::default()
        };
        let out = query.apply(samples(&[(i64::MIN + 1, 1.0)]));
        assert_eq!(out, samples(&[(i64::MIN, 1.0)]));
    }

    #[test]
    fn test_series_filters_before_aggregation_limit_after() {
        let query = TimeSeriesQuery {
            aggregation: Some(Aggregation { kind: AggregationKind::Count, bucket_ms: 10 }),
            filter_value_range: Some((2.0, 10.0)),
            limit: Some(1),
            ..Default::default()
        };
        let out = query.apply(samples(&[(1, 1.0), (5, 3.0), (7, 4.0), (12, 10.0)]));
        assert_eq!(out, samples(&[(0, 2.0)]));

        let by_ts = TimeSeriesQuery { filter_timestamps: Some(vec![5, 12]), ..Default::default() };
        assert_eq!(by_ts.apply(samples(&[(1, 1.0), (5, 3.0), (12, 10.0)])), samples(&[(5, 3.0), (12, 10.0)]));
    }

    #[test]
    fn test_series_query_validation() {
        let bad = TimeSeriesQuery {
            aggregation: Some(Aggregation { kind: AggregationKind::Sum, bucket_ms: 0 }),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        assert!(TimeSeriesQuery::default().validate().is_ok());
    }
}
