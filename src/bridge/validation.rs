// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inbound message validation.
//!
//! Checks run in a fixed order: blacklist, size, empty topic. A rejected
//! message is counted and dropped; it never surfaces as an error to the
//! transport that delivered it.

use serde_json::Value;
use thiserror::Error;

use super::envelope::encode_data;
use crate::config::BridgeConfig;

/// Substrings of overlay topics the node uses for its own housekeeping.
const INTERNAL_TOPIC_MARKERS: [&str; 5] = [
    "_peer-discovery",
    "dbupdate",
    "pindb",
    "fetch-latency-request",
    "api-latency",
];

/// Topics the bridge never touches and never counts.
#[must_use]
pub fn is_internal_topic(topic: &str) -> bool {
    topic.starts_with("/orbitdb/") || INTERNAL_TOPIC_MARKERS.iter().any(|m| topic.contains(m))
}

/// Why a message was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("topic matches blacklist pattern '{pattern}'")]
    Blacklisted { pattern: String },

    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("empty topic")]
    EmptyTopic,
}

impl Rejection {
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Blacklisted { .. } => "blacklisted",
            Self::TooLarge { .. } => "too_large",
            Self::EmptyTopic => "empty_topic",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageValidator {
    blacklist: Vec<String>,
    max_size: usize,
}

impl MessageValidator {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            blacklist: config
                .topic_blacklist
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            max_size: config.max_message_size,
        }
    }

    pub fn validate(&self, topic: &str, data: &Value) -> Result<(), Rejection> {
        if let Some(pattern) = self.blacklist.iter().find(|p| topic.contains(p.as_str())) {
            return Err(Rejection::Blacklisted { pattern: pattern.clone() });
        }

        let size = encode_data(data).len();
        if size > self.max_size {
            return Err(Rejection::TooLarge { size, max: self.max_size });
        }

        if topic.trim().is_empty() {
            return Err(Rejection::EmptyTopic);
        }

        Ok(())
    }
}
