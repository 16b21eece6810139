// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-hash idempotency gate.
//!
//! Replication redelivers entries, sometimes concurrently. The guard makes
//! sure exactly one delivery of a hash reaches the index writers:
//!
//! ```text
//! should_process(h) ──claim won──► write ──ok──► mark_processed(h)
//!        │                             └──err──► abandon(h)   (retry on redelivery)
//!        └──claim lost / processed──► skip
//! ```

use std::sync::Arc;

use tracing::{debug, warn};

use super::traits::{DedupStore, IndexError};

#[derive(Clone)]
pub struct DedupGuard {
    store: Arc<dyn DedupStore>,
}

impl DedupGuard {
    pub fn new(store: Arc<dyn DedupStore>) -> Self {
        Self { store }
    }

    /// True for exactly one caller per unprocessed hash.
    ///
    /// Concurrent callers for the same hash, and every caller after
    /// [`mark_processed`](Self::mark_processed), get `false`.
    pub async fn should_process(&self, hash: &str) -> Result<bool, IndexError> {
        let claimed = self.store.try_claim(hash).await?;
        if !claimed {
            debug!(hash = %hash, "Entry already processed or in flight");
        }
        Ok(claimed)
    }

    pub async fn mark_processed(&self, hash: &str) -> Result<(), IndexError> {
        self.store.mark_processed(hash).await
    }

    /// Release a claim after a failed write.
    ///
    /// Failure to release is logged, not returned: the claim expires on its own.
    pub async fn abandon(&self, hash: &str) {
        if let Err(e) = self.store.release_claim(hash).await {
            warn!(hash = %hash, error = %e, "Failed to release dedup claim; it will expire");
        }
    }

    pub async fn is_processed(&self, hash: &str) -> Result<bool, IndexError> {
        self.store.is_processed(hash).await
    }
}
