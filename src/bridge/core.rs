// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The bridge pipeline.
//!
//! Every inbound message runs the same stages, in order:
//!
//! ```text
//! inbound ─► internal topic? ─► validate ─► loop guard ─► own echo? ─► forward ─► local fan-out
//!               (ignored)       (rejected)   (duplicate)    (echo)      per-destination breaker
//! ```
//!
//! Routing: broker → overlay + local, overlay → broker + local,
//! local → overlay + broker + local. Disabled channels are skipped.
//! The overlay receives the [`BridgeMessage`] envelope; broker and local
//! subscribers receive only the data.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use super::envelope::{encode_data, parse_payload, unwrap_envelope, BridgeMessage, Channel};
use super::loop_guard::LoopGuard;
use super::stats::{HealthSnapshot, MetricsCollector, MetricsSnapshot};
use super::subscriptions::SubscriptionRegistry;
use super::transport::{LocalSink, Transport, TransportError};
use super::validation::{is_internal_topic, MessageValidator, Rejection};
use crate::config::BridgeConfig;
use crate::metrics;
use crate::resilience::circuit_breaker::{BreakerSet, CircuitConfig, CircuitError};

/// A message as delivered by a transport adapter.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Internal topic or disabled source channel; not counted
    Ignored,
    Rejected(Rejection),
    /// Fingerprint seen within the TTL window
    Duplicate,
    /// This node's own broker relay, back from the overlay
    Echo,
    Forwarded(ForwardReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardReport {
    pub published: Vec<Channel>,
    /// Destinations whose publish failed or whose breaker was open
    pub failed: Vec<Channel>,
    pub local_recipients: usize,
}

impl ForwardReport {
    #[must_use]
    pub fn delivered_anywhere(&self) -> bool {
        !self.published.is_empty() || self.local_recipients > 0
    }
}

pub struct TransportBridge {
    config: BridgeConfig,
    overlay: Arc<dyn Transport>,
    broker: Arc<dyn Transport>,
    local: Arc<dyn LocalSink>,
    validator: MessageValidator,
    loop_guard: LoopGuard,
    breakers: BreakerSet,
    registry: SubscriptionRegistry,
    stats: MetricsCollector,
    /// Serializes upstream subscribe/unsubscribe so 0 ↔ 1 transitions
    /// reach the transports in registry order
    upstream_lock: AsyncMutex<()>,
}

impl TransportBridge {
    pub fn new(
        config: BridgeConfig,
        overlay: Arc<dyn Transport>,
        broker: Arc<dyn Transport>,
        local: Arc<dyn LocalSink>,
    ) -> Self {
        info!(
            node_id = %config.node_id,
            overlay = config.enable_overlay,
            broker = config.enable_broker,
            local = config.enable_local,
            ttl_ms = config.message_ttl_ms,
            "Transport bridge created"
        );
        Self {
            validator: MessageValidator::new(&config),
            loop_guard: LoopGuard::new(config.message_ttl()),
            breakers: BreakerSet::new(&CircuitConfig::from(&config)),
            registry: SubscriptionRegistry::new(),
            stats: MetricsCollector::new(),
            upstream_lock: AsyncMutex::new(()),
            config,
            overlay,
            broker,
            local,
        }
    }

    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    #[must_use]
    pub fn is_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Overlay => self.config.enable_overlay,
            Channel::Broker => self.config.enable_broker,
            Channel::Local => self.config.enable_local,
        }
    }

    fn routes(source: Channel) -> &'static [Channel] {
        match source {
            Channel::Broker => &[Channel::Overlay, Channel::Local],
            Channel::Overlay => &[Channel::Broker, Channel::Local],
            Channel::Local => &[Channel::Overlay, Channel::Broker, Channel::Local],
        }
    }

    fn upstreams(&self) -> impl Iterator<Item = (Channel, &Arc<dyn Transport>)> + '_ {
        [(Channel::Overlay, &self.overlay), (Channel::Broker, &self.broker)]
            .into_iter()
            .filter(|(channel, _)| self.is_enabled(*channel))
    }

    /// Run one inbound message through the pipeline.
    ///
    /// Never fails: every outcome is counted and reported in the returned
    /// [`Disposition`].
    #[instrument(skip(self, payload), fields(channel = %source))]
    pub async fn handle_inbound(&self, source: Channel, topic: &str, payload: &[u8]) -> Disposition {
        if is_internal_topic(topic) || !self.is_enabled(source) {
            return Disposition::Ignored;
        }
        self.stats.record_received(source);

        let parsed = parse_payload(payload);
        let (envelope, data) = if source == Channel::Overlay {
            unwrap_envelope(parsed)
        } else {
            (None, parsed)
        };

        if let Err(rejection) = self.validator.validate(topic, &data) {
            debug!(topic, reason = rejection.reason(), "Message rejected: {}", rejection);
            self.stats.record_rejected(source);
            return Disposition::Rejected(rejection);
        }

        let fingerprint = LoopGuard::fingerprint(topic, &data);
        if !self.loop_guard.check_and_record(&fingerprint) {
            debug!(topic, "Dropped duplicate within loop window");
            self.stats.record_duplicate(source);
            self.stats.record_loop_prevented();
            return Disposition::Duplicate;
        }
        metrics::set_loop_guard_entries(self.loop_guard.len());

        if envelope.as_ref().is_some_and(|e| e.is_echo_of(&self.config.node_id)) {
            debug!(topic, "Dropped echo of own broker relay");
            self.stats.record_loop_prevented();
            return Disposition::Echo;
        }

        let mut report = ForwardReport::default();
        for &destination in Self::routes(source) {
            if !self.is_enabled(destination) {
                continue;
            }
            match destination {
                Channel::Local => report.local_recipients = self.fan_out(topic, &data).await,
                upstream => {
                    if self.forward(source, upstream, topic, &data).await {
                        report.published.push(upstream);
                    } else {
                        report.failed.push(upstream);
                    }
                }
            }
        }

        if !report.delivered_anywhere() {
            // Nothing left the node, so a redelivery from the source is new traffic
            self.loop_guard.forget(&fingerprint);
        }
        Disposition::Forwarded(report)
    }

    async fn forward(&self, source: Channel, destination: Channel, topic: &str, data: &Value) -> bool {
        let (transport, payload, qos) = match destination {
            Channel::Overlay => {
                let envelope = BridgeMessage::wrap(source, Some(self.config.node_id.clone()), data.clone());
                (&self.overlay, envelope.to_bytes(), 0)
            }
            _ => (&self.broker, encode_data(data), self.config.broker_qos),
        };

        let start = Instant::now();
        let result = self
            .breakers
            .get(destination)
            .call(|| transport.publish(topic, &payload, qos))
            .await;

        match result {
            Ok(()) => {
                metrics::record_forward_latency(destination.as_str(), start.elapsed());
                self.stats.record_published(destination);
                debug!(topic, to = %destination, "Forwarded");
                true
            }
            Err(CircuitError::Rejected) => {
                self.stats.record_failed(destination, "circuit breaker open");
                false
            }
            Err(CircuitError::Inner(e)) => {
                warn!(topic, to = %destination, error = %e, "Forward failed");
                self.stats.record_failed(destination, &e.to_string());
                false
            }
        }
    }

    /// Emit to the topic's local subscribers only. Returns the delivered count.
    async fn fan_out(&self, topic: &str, data: &Value) -> usize {
        let subscribers = self.registry.subscribers(topic);
        if subscribers.is_empty() {
            return 0;
        }

        let breaker = self.breakers.get(Channel::Local);
        let mut delivered = 0;
        for subscriber in &subscribers {
            match breaker.call(|| self.local.emit(subscriber, topic, data)).await {
                Ok(()) => delivered += 1,
                Err(CircuitError::Rejected) => {
                    self.stats.record_failed(Channel::Local, "circuit breaker open");
                }
                Err(CircuitError::Inner(e)) => {
                    warn!(topic, subscriber = %subscriber, error = %e, "Local delivery failed");
                    self.stats.record_failed(Channel::Local, &e.to_string());
                }
            }
        }
        self.stats.record_broadcast(delivered);
        delivered
    }

    /// Register a local subscriber's interest in a topic.
    ///
    /// The first subscriber to a topic subscribes upstream; returns whether
    /// that happened. If the upstream subscribe fails the interest is rolled
    /// back.
    pub async fn subscribe_local(&self, subscriber: &str, topic: &str) -> Result<bool, TransportError> {
        let _upstream = self.upstream_lock.lock().await;
        if !self.registry.add_local_interest(topic, subscriber) {
            return Ok(false);
        }

        let mut subscribed: Vec<(Channel, &Arc<dyn Transport>)> = Vec::new();
        for (channel, transport) in self.upstreams() {
            if let Err(e) = transport.subscribe(topic).await {
                warn!(topic, channel = %channel, error = %e, "Upstream subscribe failed");
                for (done_channel, done) in subscribed {
                    if let Err(rollback) = done.unsubscribe(topic).await {
                        warn!(
                            topic,
                            channel = %done_channel,
                            error = %rollback,
                            "Rollback unsubscribe failed, upstream left subscribed"
                        );
                        self.stats.record_failed(done_channel, &rollback.to_string());
                    }
                }
                self.registry.remove_local_interest(topic, subscriber);
                return Err(e);
            }
            subscribed.push((channel, transport));
        }

        metrics::set_local_topics(self.registry.topic_count());
        info!(topic, subscriber, "First local subscriber, subscribed upstream");
        Ok(true)
    }

    /// Drop a local subscriber's interest in a topic.
    ///
    /// Returns whether the topic was unsubscribed upstream.
    pub async fn unsubscribe_local(&self, subscriber: &str, topic: &str) -> Result<bool, TransportError> {
        let _upstream = self.upstream_lock.lock().await;
        if !self.registry.remove_local_interest(topic, subscriber) {
            return Ok(false);
        }
        metrics::set_local_topics(self.registry.topic_count());
        self.unsubscribe_upstream(topic).await?;
        info!(topic, subscriber, "Last local subscriber left, unsubscribed upstream");
        Ok(true)
    }

    /// Forget a disconnected local subscriber.
    ///
    /// Returns the topics that were unsubscribed upstream as a result.
    pub async fn disconnect_local(&self, subscriber: &str) -> Vec<String> {
        let _upstream = self.upstream_lock.lock().await;
        let orphaned = self.registry.remove_subscriber(subscriber);
        for topic in &orphaned {
            // Errors are logged; the subscriber is gone either way
            let _ = self.unsubscribe_upstream(topic).await;
        }
        metrics::set_local_topics(self.registry.topic_count());
        debug!(subscriber, released = orphaned.len(), "Local subscriber disconnected");
        orphaned
    }

    /// Unsubscribe on every enabled upstream, returning the first error.
    async fn unsubscribe_upstream(&self, topic: &str) -> Result<(), TransportError> {
        let mut first_error = None;
        for (channel, transport) in self.upstreams() {
            if let Err(e) = transport.unsubscribe(topic).await {
                warn!(topic, channel = %channel, error = %e, "Upstream unsubscribe failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drive one channel's inbound traffic until the sender side closes.
    ///
    /// Messages from a channel are handled one at a time, in delivery order.
    pub fn spawn_ingest(self: &Arc<Self>, source: Channel, mut rx: mpsc::Receiver<InboundMessage>) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                bridge.handle_inbound(source, &message.topic, &message.payload).await;
            }
            debug!(channel = %source, "Ingest channel closed");
        })
    }

    /// Evict expired loop-guard fingerprints every `every` until `shutdown`
    /// flips to true or its sender is dropped.
    pub fn spawn_purge(self: &Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = bridge.loop_guard.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Purged expired loop fingerprints");
                        }
                        metrics::set_loop_guard_entries(bridge.loop_guard.len());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Loop guard purge stopped");
        })
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.stats.snapshot(self.breakers.snapshots(), self.registry.topic_count())
    }

    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        self.stats.health(|channel| {
            let connected = match channel {
                Channel::Overlay => self.overlay.is_connected(),
                Channel::Broker => self.broker.is_connected(),
                Channel::Local => true,
            };
            (self.is_enabled(channel), connected, self.breakers.get(channel).state())
        })
    }

    #[must_use]
    pub fn breakers(&self) -> &BreakerSet {
        &self.breakers
    }

    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    #[must_use]
    pub fn loop_guard(&self) -> &LoopGuard {
        &self.loop_guard
    }

    #[must_use]
    pub fn stats(&self) -> &MetricsCollector {
        &self.stats
    }
}
