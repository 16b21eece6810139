// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Nodeweave
//!
//! Node-local machinery for a peer-to-peer node that keeps replicated, signed
//! documents and relays realtime messages between transport planes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Replicated log (external)                  │
//! │  • Calls put(hash, bytes) on append and on replication      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SecondaryIndexStore                      │
//! │  • Decode entry, claim hash (DedupGuard)                    │
//! │  • Route by objectType: document / stream / geo /           │
//! │    timeseries / sortedset                                   │
//! │  • Query surface with per-call timeouts                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Backend: Redis Stack, or in-memory (DashMap)         │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌──────────┐      ┌─────────────────────────────┐      ┌──────────┐
//! │ Overlay  │ ◄──► │       TransportBridge       │ ◄──► │  Broker  │
//! └──────────┘      │  validate → loop guard →    │      └──────────┘
//!                   │  echo check → breaker →     │
//!                   │  forward → local fan-out    │
//!                   └─────────────────────────────┘
//!                                 │
//!                                 ▼
//!                       Local realtime subscribers
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nodeweave::{IndexConfig, PutOutcome, SecondaryIndexStore};
//! use nodeweave::entry::ObjectType;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = IndexConfig {
//!         redis_url: Some("redis://localhost:6379".into()),
//!         ..Default::default()
//!     };
//!     let store = SecondaryIndexStore::from_config(&config).await?;
//!
//!     let raw = br#"{"id":"/orbitdb/zdpuLog","payload":{"op":"PUT","key":"k",
//!         "value":{"_id":"r1","publicKey":"pk","sig":"s","timestamp":1,
//!         "objectType":"document","data":{"name":"Ada"}}}}"#;
//!     assert_eq!(store.put("zdpuHash", raw).await?, PutOutcome::Indexed(ObjectType::Document));
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See [`NodeConfig`], [`IndexConfig`] and [`BridgeConfig`].
//!
//! ## Modules
//!
//! - [`entry`]: Log entry decoding and per-type write extraction
//! - [`index`]: The secondary-index store, its backends and queries
//! - [`bridge`]: The multi-transport message bridge
//! - [`resilience`]: Circuit breakers, retry logic
//! - [`metrics`]: `metrics` crate facade

pub mod bridge;
pub mod config;
pub mod entry;
pub mod index;
pub mod metrics;
pub mod resilience;

pub use bridge::{Channel, Disposition, HealthSnapshot, LocalSink, MetricsSnapshot, Transport, TransportBridge, TransportError};
pub use config::{BridgeConfig, ConfigError, IndexConfig, NodeConfig};
pub use entry::{DecodeError, LogEntry, ObjectType};
pub use index::{IndexError, InMemoryIndex, IterOptions, PutOutcome, RedisIndex, SecondaryIndexStore};
pub use resilience::circuit_breaker::{BreakerSet, CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
pub use resilience::retry::RetryConfig;
