// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backoff retry for Redis index calls.
//!
//! Only idempotent backend calls go through here; appends that would
//! duplicate on a lost reply rely on log redelivery instead. A call is
//! retried only while its error is transient (connection trouble, timeouts,
//! a server still loading). Command errors such as `WRONGTYPE`, a RedisJSON
//! parse failure or `NOSCRIPT` return on the first attempt.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use nodeweave::resilience::retry::RetryConfig;
//!
//! let delays: Vec<Duration> = RetryConfig::query().backoff().collect();
//! assert_eq!(delays, vec![Duration::from_millis(100), Duration::from_millis(200)]);
//! ```

use std::future::Future;
use std::time::Duration;

use redis::{ErrorKind, RedisError};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff settings for a retried backend call.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts, including the first
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Connecting to Redis: a few seconds of patience for a server that is
    /// still starting, then give up so a bad URL surfaces quickly.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Index reads and idempotent index writes.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Delays between attempts; one fewer than `max_attempts`.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_delay,
            max: self.max_delay,
            factor: self.factor,
            remaining: self.max_attempts.saturating_sub(1),
        }
    }
}

/// Exponential delay sequence capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    factor: f64,
    remaining: usize,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let current = self.next.min(self.max);
        self.next = self.next.mul_f64(self.factor).min(self.max);
        Some(current)
    }
}

/// Errors worth another attempt: the connection, not the command, failed.
pub fn is_transient(err: &RedisError) -> bool {
    err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
        || matches!(err.kind(), ErrorKind::TryAgain | ErrorKind::BusyLoadingError)
}

/// Run `operation`, retrying with backoff while `should_retry` accepts the
/// error and attempts remain.
pub async fn retry<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut backoff = config.backoff();
    let mut attempt = 1;

    loop {
        let err = match operation().await {
            Ok(val) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "backend call recovered");
                }
                return Ok(val);
            }
            Err(err) => err,
        };

        if !should_retry(&err) {
            return Err(err);
        }
        let Some(delay) = backoff.next() else {
            return Err(err);
        };

        warn!(
            operation = operation_name,
            attempt,
            max_attempts = config.max_attempts,
            error = %err,
            ?delay,
            "transient backend error, retrying"
        );
        sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            factor: 2.0,
        }
    }

    fn reset() -> RedisError {
        RedisError::from(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"))
    }

    fn wrong_type() -> RedisError {
        RedisError::from((ErrorKind::TypeError, "WRONGTYPE Operation against a key holding the wrong kind of value"))
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&reset()));
        assert!(is_transient(&RedisError::from((ErrorKind::BusyLoadingError, "LOADING"))));
        assert!(!is_transient(&wrong_type()));
        assert!(!is_transient(&RedisError::from((ErrorKind::NoScriptError, "NOSCRIPT"))));
        assert!(!is_transient(&RedisError::from((ErrorKind::ResponseError, "ERR new objects must be created at the root"))));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            factor: 2.0,
        };
        let delays: Vec<u64> = config.backoff().map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 3, 3]);

        let single = RetryConfig { max_attempts: 1, ..config };
        assert_eq!(single.backoff().count(), 0);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let result: Result<&str, RedisError> = retry("geopos", &fast(), is_transient, move || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(reset())
            } else {
                Ok("ok")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_command_errors_return_after_one_attempt() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let result: Result<(), RedisError> = retry("geoadd", &fast(), is_transient, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(wrong_type())
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::TypeError);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_give_up_after_max_attempts() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let result: Result<(), RedisError> = retry("smembers", &fast(), is_transient, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(reset())
        })
        .await;

        assert!(result.unwrap_err().is_io_error());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
