// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local subscriber bookkeeping.
//!
//! Many local subscribers share a single upstream subscription per topic.
//! Every mutator reports whether the topic just crossed the 0 ↔ 1 boundary,
//! which is the only time the bridge talks to the upstream transports.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

#[derive(Default)]
pub struct SubscriptionRegistry {
    topics: Mutex<HashMap<String, HashSet<String>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when this is the topic's first subscriber (subscribe upstream).
    pub fn add_local_interest(&self, topic: &str, subscriber: &str) -> bool {
        let mut topics = self.topics.lock();
        match topics.get_mut(topic) {
            Some(subscribers) => {
                subscribers.insert(subscriber.to_string());
                false
            }
            None => {
                topics.insert(topic.to_string(), HashSet::from([subscriber.to_string()]));
                true
            }
        }
    }

    /// Returns true when the topic lost its last subscriber (unsubscribe upstream).
    pub fn remove_local_interest(&self, topic: &str, subscriber: &str) -> bool {
        let mut topics = self.topics.lock();
        let Some(subscribers) = topics.get_mut(topic) else {
            return false;
        };
        if !subscribers.remove(subscriber) {
            return false;
        }
        if subscribers.is_empty() {
            topics.remove(topic);
            true
        } else {
            false
        }
    }

    /// Drop every interest held by a subscriber.
    ///
    /// Returns the topics that were left with no subscribers.
    pub fn remove_subscriber(&self, subscriber: &str) -> Vec<String> {
        let mut topics = self.topics.lock();
        let mut orphaned = Vec::new();
        topics.retain(|topic, subscribers| {
            if subscribers.remove(subscriber) && subscribers.is_empty() {
                orphaned.push(topic.clone());
                return false;
            }
            true
        });
        orphaned.sort();
        orphaned
    }

    #[must_use]
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.topics
            .lock()
            .get(topic)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_subscribed(&self, topic: &str, subscriber: &str) -> bool {
        self.topics.lock().get(topic).is_some_and(|s| s.contains(subscriber))
    }

    /// Number of topics with at least one local subscriber.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }
}
