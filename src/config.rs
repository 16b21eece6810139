// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the index store and the transport bridge.
//!
//! # Example
//!
//! ```
//! use nodeweave::{BridgeConfig, IndexConfig, NodeConfig};
//!
//! // Minimal config (uses defaults, in-memory index)
//! let config = NodeConfig::default();
//! assert!(config.index.redis_url.is_none());
//! assert_eq!(config.bridge.message_ttl_ms, 5_000);
//!
//! // Redis-backed index with a short query timeout
//! let config = NodeConfig {
//!     index: IndexConfig {
//!         redis_url: Some("redis://localhost:6379".into()),
//!         query_timeout_ms: 1_000,
//!         ..Default::default()
//!     },
//!     bridge: BridgeConfig::default(),
//! };
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// Secondary-index storage configuration.
///
/// Without a `redis_url` the node indexes into process memory, which is
/// fine for tests and ephemeral nodes but does not survive restarts.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    /// Redis Stack connection string (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace prepended to every physical key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Default timeout applied to every query read
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// How long an in-flight dedup claim lives before another delivery may retry
    #[serde(default = "default_claim_ttl_ms")]
    pub claim_ttl_ms: u64,

    /// Time-series retention window (0 = keep forever)
    #[serde(default = "default_timeseries_retention_ms")]
    pub timeseries_retention_ms: u64,

    /// Keep raw entry bytes so `get`/`iterator` can answer from the index store
    #[serde(default)]
    pub retain_raw_entries: bool,
}

fn default_key_prefix() -> String { "nodeweave:".to_string() }
fn default_query_timeout_ms() -> u64 { 5_000 }
fn default_claim_ttl_ms() -> u64 { 30_000 }
fn default_timeseries_retention_ms() -> u64 { 86_400_000 } // 1 day

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            query_timeout_ms: default_query_timeout_ms(),
            claim_ttl_ms: default_claim_ttl_ms(),
            timeseries_retention_ms: default_timeseries_retention_ms(),
            retain_raw_entries: false,
        }
    }
}

impl IndexConfig {
    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    #[must_use]
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_millis(self.claim_ttl_ms)
    }
}

/// Transport bridge configuration.
///
/// Every field can be loaded from the environment with [`BridgeConfig::from_env`].
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// This node's identity on the broker plane, stamped into envelopes
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Loop-prevention fingerprint lifetime
    #[serde(default = "default_message_ttl_ms")]
    pub message_ttl_ms: u64,

    /// Largest serialized payload the bridge will relay
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "default_true")]
    pub enable_overlay: bool,
    #[serde(default = "default_true")]
    pub enable_broker: bool,
    #[serde(default = "default_true")]
    pub enable_local: bool,

    /// Broker QoS level (0, 1 or 2)
    #[serde(default)]
    pub broker_qos: u8,

    /// Consecutive failures before a channel's breaker opens
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    /// How long an open breaker waits before allowing a probe
    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,

    /// Topics containing any of these patterns are never bridged
    #[serde(default)]
    pub topic_blacklist: Vec<String>,

    /// Default log filter used by binaries that install a subscriber
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String { uuid::Uuid::new_v4().to_string() }
fn default_message_ttl_ms() -> u64 { 5_000 }
fn default_max_message_size() -> usize { 1024 * 1024 } // 1 MB
fn default_true() -> bool { true }
fn default_breaker_threshold() -> u32 { 10 }
fn default_breaker_cooldown_ms() -> u64 { 60_000 }
fn default_log_level() -> String { "info".to_string() }

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            message_ttl_ms: default_message_ttl_ms(),
            max_message_size: default_max_message_size(),
            enable_overlay: true,
            enable_broker: true,
            enable_local: true,
            broker_qos: 0,
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
            topic_blacklist: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

impl BridgeConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&std::env::vars().collect())
    }

    /// Load from an explicit variable map (the environment, in production).
    ///
    /// Flags stay enabled unless set to exactly `false`. Unparseable numbers
    /// fall back to their defaults.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(id) = vars.get("BRIDGE_NODE_ID").filter(|v| !v.trim().is_empty()) {
            config.node_id = id.trim().to_string();
        }
        config.message_ttl_ms = parse_or(vars, "BRIDGE_MESSAGE_TTL", config.message_ttl_ms);
        config.max_message_size = parse_or(vars, "BRIDGE_MAX_MESSAGE_SIZE", config.max_message_size);
        config.enable_broker = flag(vars, "BRIDGE_ENABLE_MQTT");
        config.enable_local = flag(vars, "BRIDGE_ENABLE_SOCKET");
        config.enable_overlay = flag(vars, "BRIDGE_ENABLE_OVERLAY");
        config.breaker_threshold = parse_or(vars, "BRIDGE_CIRCUIT_BREAKER_THRESHOLD", config.breaker_threshold);
        config.breaker_cooldown_ms = parse_or(vars, "BRIDGE_CIRCUIT_BREAKER_TIMEOUT", config.breaker_cooldown_ms);

        let qos: u8 = parse_or(vars, "BRIDGE_MQTT_QOS", 0);
        if qos > 2 {
            return Err(ConfigError::Invalid {
                key: "BRIDGE_MQTT_QOS".into(),
                reason: format!("{} is not a valid QoS level (0..=2)", qos),
            });
        }
        config.broker_qos = qos;

        if let Some(list) = vars.get("BRIDGE_TOPIC_BLACKLIST") {
            config.topic_blacklist = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(level) = vars.get("LOG_LEVEL").filter(|v| !v.is_empty()) {
            config.log_level = level.clone();
        }

        Ok(config)
    }

    #[must_use]
    pub fn message_ttl(&self) -> Duration {
        Duration::from_millis(self.message_ttl_ms)
    }

    #[must_use]
    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }
}

fn flag(vars: &HashMap<String, String>, key: &str) -> bool {
    vars.get(key).map_or(true, |v| v != "false")
}

fn parse_or<T>(vars: &HashMap<String, String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Debug,
{
    match vars.get(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, ?default, "Unparseable bridge setting, using default");
            default
        }),
    }
}
