// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Secondary-index storage engine.
//!
//! The replicated log calls [`SecondaryIndexStore::put`] for every appended or
//! replicated entry. Entries are decoded, gated by [`DedupGuard`], and routed
//! to one of five index structures by their object type. Backends:
//!
//! - [`RedisIndex`](redis::RedisIndex): Redis Stack (RedisJSON, RedisTimeSeries,
//!   sorted sets, GEO). Dedup markers persist across restarts.
//! - [`InMemoryIndex`](memory::InMemoryIndex): same semantics, process-local.

pub mod dedup;
pub mod geo;
pub mod memory;
pub mod query;
pub mod redis;
pub mod store;
pub mod traits;

pub use dedup::DedupGuard;
pub use geo::{GeoCenter, GeoUnit};
pub use memory::InMemoryIndex;
pub use query::{
    Aggregation, AggregationKind, CompareOp, Condition, DocumentQueryOptions, SortOrder, TimeSeriesQuery,
};
pub use redis::RedisIndex;
pub use store::{IterOptions, PutOutcome, SecondaryIndexStore};
pub use traits::{
    DedupStore, DocumentOutcome, GeoMatch, GeoPoint, IndexBackend, IndexError, Sample, ScoredRecord, StreamRecord,
};
