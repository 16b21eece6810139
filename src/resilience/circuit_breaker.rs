// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consecutive-failure circuit breaker.
//!
//! Isolates a failing transport so the bridge stops hammering it. One breaker
//! per channel, each an independent state machine:
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────► Open
//!     ▲  ▲                             │ cooldown elapsed,
//!     │  └── success ── HalfOpen ◄─────┘ next check admits one probe
//!     │                   │
//!     │                   └── failure ──► Open (re-stamped)
//!     └── success while closed: consecutive_failures -= 1
//! ```
//!
//! # Example
//!
//! ```
//! use nodeweave::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitState};
//! use std::time::Duration;
//!
//! let cb = CircuitBreaker::new("broker", CircuitConfig { failure_threshold: 2, cooldown: Duration::from_secs(60) });
//! cb.record_failure();
//! cb.record_failure();
//! assert_eq!(cb.state(), CircuitState::Open);
//! assert!(!cb.try_acquire());
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bridge::envelope::Channel;
use crate::config::BridgeConfig;

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half-open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open)
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// How long an open circuit waits before admitting a probe
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl From<&BridgeConfig> for CircuitConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            failure_threshold: config.breaker_threshold.max(1),
            cooldown: config.breaker_cooldown(),
        }
    }
}

impl CircuitConfig {
    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            cooldown: Duration::from_millis(50),
        }
    }
}

/// Point-in-time view of a breaker, as served by the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub channel: String,
    pub consecutive_failures: u32,
    /// Unix epoch milliseconds
    pub last_failure_at: Option<u64>,
    pub state: CircuitState,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_wall: Option<u64>,
    /// Set while the half-open probe is outstanding
    probe_started: Option<Instant>,
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let name = name.into();
        crate::metrics::set_circuit_state(&name, CircuitState::Closed as u8);
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                last_failure_wall: None,
                probe_started: None,
            }),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Create with default config
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        match to {
            CircuitState::Open => warn!(
                circuit = %self.name,
                failures = inner.consecutive_failures,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => info!(circuit = %self.name, "Circuit breaker half-open, admitting probe"),
            CircuitState::Closed => info!(circuit = %self.name, "Circuit breaker closed"),
        }
        inner.state = to;
        crate::metrics::set_circuit_state(&self.name, to as u8);
    }

    /// Ask permission for one operation.
    ///
    /// Open circuits reject until the cooldown has elapsed since the last
    /// failure; the first check after that moves to half-open and is the
    /// only one admitted until the probe reports back.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() > self.config.cooldown);
                if cooled {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_started = Some(Instant::now());
                }
                cooled
            }
            CircuitState::HalfOpen => {
                // A probe whose caller never reported back is forfeited after a cooldown
                let stale = inner
                    .probe_started
                    .map_or(true, |at| at.elapsed() > self.config.cooldown);
                if stale {
                    inner.probe_started = Some(Instant::now());
                }
                stale
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_failures = 0;
                inner.probe_started = None;
                self.transition(&mut inner, CircuitState::Closed);
            }
            CircuitState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_sub(1);
            }
            // Late result from a call admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_wall = Some(epoch_ms());
        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_started = None;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    /// Execute an async operation through the circuit breaker
    ///
    /// Takes a closure that returns a Future, allowing lazy evaluation
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        if !self.try_acquire() {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            debug!(circuit = %self.name, "Circuit breaker rejected call (open)");
            crate::metrics::record_circuit_call(&self.name, "rejected");
            return Err(CircuitError::Rejected);
        }

        match f().await {
            Ok(result) => {
                self.record_success();
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(e) => {
                self.record_failure();
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            channel: self.name.clone(),
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_wall,
            state: inner.state,
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// One independent breaker per bridge channel.
pub struct BreakerSet {
    breakers: [CircuitBreaker; 3],
}

impl BreakerSet {
    #[must_use]
    pub fn new(config: &CircuitConfig) -> Self {
        Self {
            breakers: Channel::ALL.map(|channel| CircuitBreaker::new(channel.as_str(), config.clone())),
        }
    }

    #[must_use]
    pub fn get(&self, channel: Channel) -> &CircuitBreaker {
        &self.breakers[channel.index()]
    }

    /// Snapshots in channel order (overlay, broker, local).
    #[must_use]
    pub fn snapshots(&self) -> Vec<CircuitBreakerState> {
        self.breakers.iter().map(CircuitBreaker::snapshot).collect()
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
