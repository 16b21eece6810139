// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process bridge counters and the operator snapshots built from them.
//!
//! Every event is counted twice: in atomics here, so [`MetricsSnapshot`] and
//! [`HealthSnapshot`] can be served without an exporter, and through the
//! [`crate::metrics`] facade for whatever recorder the host installs.
//!
//! `received`, `rejected` and `duplicates` are counted on the channel a message
//! arrived on; `published`, `failed` and `broadcast` on the channel it was
//! forwarded to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use super::envelope::{now_ms, Channel};
use crate::resilience::circuit_breaker::{CircuitBreakerState, CircuitState};

#[derive(Default)]
struct ChannelCounters {
    received: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    broadcast: AtomicU64,
    last_error: Mutex<Option<(String, i64)>>,
}

impl ChannelCounters {
    fn snapshot(&self) -> ChannelStats {
        let last_error = self.last_error.lock().clone();
        ChannelStats {
            received: self.received.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            broadcast: self.broadcast.load(Ordering::Relaxed),
            last_error_at: last_error.as_ref().map(|(_, at)| *at),
            last_error: last_error.map(|(e, _)| e),
        }
    }
}

/// A value for each channel, serialized as `{overlay, broker, local}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerChannel<T> {
    pub overlay: T,
    pub broker: T,
    pub local: T,
}

impl<T> PerChannel<T> {
    pub fn from_fn(mut f: impl FnMut(Channel) -> T) -> Self {
        Self {
            overlay: f(Channel::Overlay),
            broker: f(Channel::Broker),
            local: f(Channel::Local),
        }
    }

    #[must_use]
    pub fn get(&self, channel: Channel) -> &T {
        match channel {
            Channel::Overlay => &self.overlay,
            Channel::Broker => &self.broker,
            Channel::Local => &self.local,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStats {
    pub received: u64,
    pub published: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub broadcast: u64,
    pub last_error: Option<String>,
    /// Unix epoch milliseconds
    pub last_error_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRates {
    /// Messages published per second of uptime
    pub publish_rate: f64,
    /// Messages received per second of uptime
    pub receive_rate: f64,
    /// `failed / max(1, received)` as a percentage, e.g. `"2.50%"`
    pub error_rate: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Uptime {
    pub ms: u64,
    pub seconds: u64,
    pub formatted: String,
}

impl Uptime {
    fn from_ms(ms: u64) -> Self {
        let seconds = ms / 1000;
        Self {
            ms,
            seconds,
            formatted: format_uptime(seconds),
        }
    }
}

/// Metrics endpoint payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub started_at: i64,
    pub uptime: Uptime,
    pub channels: PerChannel<ChannelStats>,
    pub rates: PerChannel<ChannelRates>,
    pub loops_prevented: u64,
    pub local_topics: usize,
    pub circuit_breakers: Vec<CircuitBreakerState>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelHealth {
    pub enabled: bool,
    pub connected: bool,
    pub healthy: bool,
    pub circuit_breaker: CircuitState,
    pub last_error: Option<String>,
    pub last_error_at: Option<i64>,
}

/// Health endpoint payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub timestamp: i64,
    pub uptime: Uptime,
    pub channels: PerChannel<ChannelHealth>,
}

pub struct MetricsCollector {
    started: Instant,
    started_at: i64,
    channels: [ChannelCounters; 3],
    loops_prevented: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: now_ms(),
            channels: Default::default(),
            loops_prevented: AtomicU64::new(0),
        }
    }

    fn counters(&self, channel: Channel) -> &ChannelCounters {
        &self.channels[channel.index()]
    }

    pub fn record_received(&self, channel: Channel) {
        self.counters(channel).received.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_bridge_message(channel.as_str(), "received");
    }

    pub fn record_published(&self, channel: Channel) {
        self.counters(channel).published.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_bridge_message(channel.as_str(), "published");
    }

    pub fn record_failed(&self, channel: Channel, error: &str) {
        let counters = self.counters(channel);
        counters.failed.fetch_add(1, Ordering::Relaxed);
        *counters.last_error.lock() = Some((error.to_string(), now_ms()));
        crate::metrics::record_bridge_message(channel.as_str(), "failed");
    }

    pub fn record_duplicate(&self, channel: Channel) {
        self.counters(channel).duplicates.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_bridge_message(channel.as_str(), "duplicate");
    }

    pub fn record_rejected(&self, channel: Channel) {
        self.counters(channel).rejected.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_bridge_message(channel.as_str(), "rejected");
    }

    /// Count local emits. Zero recipients is not a broadcast.
    pub fn record_broadcast(&self, recipients: usize) {
        if recipients == 0 {
            return;
        }
        self.counters(Channel::Local)
            .broadcast
            .fetch_add(recipients as u64, Ordering::Relaxed);
        for _ in 0..recipients {
            crate::metrics::record_bridge_message(Channel::Local.as_str(), "broadcast");
        }
    }

    pub fn record_loop_prevented(&self) {
        self.loops_prevented.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_loop_prevented();
    }

    #[must_use]
    pub fn channel(&self, channel: Channel) -> ChannelStats {
        self.counters(channel).snapshot()
    }

    #[must_use]
    pub fn loops_prevented(&self) -> u64 {
        self.loops_prevented.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn uptime(&self) -> Uptime {
        Uptime::from_ms(self.started.elapsed().as_millis() as u64)
    }

    #[must_use]
    pub fn snapshot(&self, breakers: Vec<CircuitBreakerState>, local_topics: usize) -> MetricsSnapshot {
        let uptime = self.uptime();
        let channels = PerChannel::from_fn(|c| self.channel(c));
        let rates = PerChannel::from_fn(|c| rates(channels.get(c), uptime.seconds));
        MetricsSnapshot {
            started_at: self.started_at,
            uptime,
            channels,
            rates,
            loops_prevented: self.loops_prevented(),
            local_topics,
            circuit_breakers: breakers,
        }
    }

    /// Build the health view from per-channel `(enabled, connected, breaker)`.
    ///
    /// Overall health considers only the enabled upstream channels.
    #[must_use]
    pub fn health(&self, status: impl Fn(Channel) -> (bool, bool, CircuitState)) -> HealthSnapshot {
        let channels = PerChannel::from_fn(|c| {
            let (enabled, connected, breaker) = status(c);
            let stats = self.channel(c);
            ChannelHealth {
                enabled,
                connected,
                healthy: connected && breaker != CircuitState::Open,
                circuit_breaker: breaker,
                last_error: stats.last_error,
                last_error_at: stats.last_error_at,
            }
        });
        let healthy = [&channels.overlay, &channels.broker]
            .iter()
            .all(|h| !h.enabled || h.healthy);
        HealthSnapshot {
            healthy,
            timestamp: now_ms(),
            uptime: self.uptime(),
            channels,
        }
    }
}

fn rates(stats: &ChannelStats, uptime_secs: u64) -> ChannelRates {
    let per_sec = |n: u64| if uptime_secs == 0 { 0.0 } else { n as f64 / uptime_secs as f64 };
    let error_pct = stats.failed as f64 / stats.received.max(1) as f64 * 100.0;
    ChannelRates {
        publish_rate: per_sec(stats.published),
        receive_rate: per_sec(stats.received),
        error_rate: format!("{error_pct:.2}%"),
    }
}

/// `"Hh Mm Ss"`
#[must_use]
pub fn format_uptime(seconds: u64) -> String {
    format!("{}h {}m {}s", seconds / 3600, (seconds % 3600) / 60, seconds % 60)
}
