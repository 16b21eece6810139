// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Short-lived fingerprint cache that stops relay loops.
//!
//! A fingerprint is the SHA-256 of `topic:payload`. Entries expire after the
//! configured TTL; expiry is checked lazily on lookup and swept by the
//! bridge's purge task. An entry that has expired but not yet been swept is
//! treated as absent, so a missed eviction never blocks traffic.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::envelope::encode_data;

pub struct LoopGuard {
    seen: DashMap<String, Instant>,
    ttl: Duration,
}

impl LoopGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
        }
    }

    #[must_use]
    pub fn fingerprint(topic: &str, data: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(topic.as_bytes());
        hasher.update(b":");
        hasher.update(encode_data(data));
        hex::encode(hasher.finalize())
    }

    /// Record a fingerprint. Returns false if it was already live.
    ///
    /// Check and insert happen under the shard lock, so of two concurrent
    /// deliveries exactly one gets `true`.
    pub fn check_and_record(&self, fingerprint: &str) -> bool {
        let now = Instant::now();
        match self.seen.entry(fingerprint.to_string()) {
            Entry::Occupied(mut e) => {
                if now.duration_since(*e.get()) < self.ttl {
                    false
                } else {
                    e.insert(now);
                    true
                }
            }
            Entry::Vacant(e) => {
                e.insert(now);
                true
            }
        }
    }

    /// Drop a fingerprint so a redelivery is treated as new.
    pub fn forget(&self, fingerprint: &str) {
        self.seen.remove(fingerprint);
    }

    #[must_use]
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.seen
            .get(fingerprint)
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    /// Remove expired fingerprints, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let before = self.seen.len();
        let ttl = self.ttl;
        self.seen.retain(|_, at| at.elapsed() < ttl);
        before.saturating_sub(self.seen.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
