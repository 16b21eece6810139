// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bridge pipeline tests with recording fake transports.
//!
//! Run with: cargo test --test bridge

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nodeweave::bridge::{Channel, Disposition, InboundMessage, LocalSink, Rejection, Transport, TransportBridge, TransportError};
use nodeweave::{BridgeConfig, CircuitState};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

const NODE_ID: &str = "node-self";

/// Records everything the bridge does to it.
#[derive(Default)]
struct FakeTransport {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    subscribes: Mutex<Vec<String>>,
    unsubscribes: Mutex<Vec<String>>,
    failing: AtomicBool,
    publish_attempts: AtomicUsize,
    disconnected: AtomicBool,
    refuse_subscribe: AtomicBool,
    refuse_unsubscribe: AtomicBool,
}

impl FakeTransport {
    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn publish_count(&self) -> usize {
        self.published.lock().len()
    }

    fn last_payload(&self) -> Value {
        let published = self.published.lock();
        let (_, bytes) = published.last().expect("nothing published");
        serde_json::from_slice(bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into()))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn publish(&self, topic: &str, payload: &[u8], _qos: u8) -> Result<(), TransportError> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("connection refused".into()));
        }
        self.published.lock().push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if self.refuse_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Subscription("not authorized".into()));
        }
        self.subscribes.lock().push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if self.refuse_unsubscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Subscription("connection lost".into()));
        }
        self.unsubscribes.lock().push(topic.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeSink {
    emitted: Mutex<Vec<(String, String, Value)>>,
}

impl FakeSink {
    fn recipients(&self) -> Vec<String> {
        let mut r: Vec<String> = self.emitted.lock().iter().map(|(s, _, _)| s.clone()).collect();
        r.sort();
        r
    }
}

#[async_trait]
impl LocalSink for FakeSink {
    async fn emit(&self, subscriber: &str, topic: &str, message: &Value) -> Result<(), TransportError> {
        self.emitted.lock().push((subscriber.to_string(), topic.to_string(), message.clone()));
        Ok(())
    }
}

struct Harness {
    bridge: Arc<TransportBridge>,
    overlay: Arc<FakeTransport>,
    broker: Arc<FakeTransport>,
    sink: Arc<FakeSink>,
}

fn harness_with(config: BridgeConfig) -> Harness {
    let overlay = Arc::new(FakeTransport::default());
    let broker = Arc::new(FakeTransport::default());
    let sink = Arc::new(FakeSink::default());
    let bridge = Arc::new(TransportBridge::new(config, overlay.clone(), broker.clone(), sink.clone()));
    Harness { bridge, overlay, broker, sink }
}

fn harness() -> Harness {
    harness_with(BridgeConfig {
        node_id: NODE_ID.into(),
        ..Default::default()
    })
}

/// What another node's bridge would put on the overlay.
fn overlay_wire(origin: &str, originator: &str, data: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "__origin": origin, "__broker": originator, "__timestamp": 1_700_000_000_000i64, "data": data
    }))
    .unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════
// Loop prevention
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_redelivered_overlay_copy_does_not_republish_to_broker() {
    let h = harness();
    let payload = br#"{"temp":21}"#;

    h.bridge.handle_inbound(Channel::Broker, "x", payload).await;
    assert_eq!(h.overlay.publish_count(), 1);

    // The overlay hands the same (topic, payload) back, wrapped by some peer
    let echoed = overlay_wire("mqtt", "node-other", json!({"temp": 21}));
    let d = h.bridge.handle_inbound(Channel::Overlay, "x", &echoed).await;

    assert_eq!(d, Disposition::Duplicate);
    assert_eq!(h.broker.publish_count(), 0);
    assert_eq!(h.bridge.stats().channel(Channel::Overlay).duplicates, 1);
    assert_eq!(h.bridge.stats().loops_prevented(), 1);
}

#[tokio::test]
async fn test_own_relay_echo_is_dropped_after_ttl() {
    let h = harness_with(BridgeConfig {
        node_id: NODE_ID.into(),
        message_ttl_ms: 20,
        ..Default::default()
    });
    h.bridge.handle_inbound(Channel::Broker, "x", b"1").await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    // Fingerprint is gone, but the envelope still names this node
    let echoed = overlay_wire("mqtt", NODE_ID, json!(1));
    let d = h.bridge.handle_inbound(Channel::Overlay, "x", &echoed).await;

    assert_eq!(d, Disposition::Echo);
    assert_eq!(h.broker.publish_count(), 0);
}

#[tokio::test]
async fn test_same_message_after_ttl_is_forwarded_again() {
    let h = harness_with(BridgeConfig {
        node_id: NODE_ID.into(),
        message_ttl_ms: 20,
        ..Default::default()
    });
    h.bridge.handle_inbound(Channel::Broker, "x", b"ping").await;
    tokio::time::sleep(Duration::from_millis(40)).await;
    h.bridge.handle_inbound(Channel::Broker, "x", b"ping").await;

    assert_eq!(h.overlay.publish_count(), 2);
}

#[tokio::test]
async fn test_peer_relay_from_another_node_is_forwarded() {
    let h = harness();
    let wire = overlay_wire("mqtt", "node-other", json!({"door": "open"}));
    let d = h.bridge.handle_inbound(Channel::Overlay, "home/door", &wire).await;

    assert!(matches!(d, Disposition::Forwarded(ref r) if r.published == vec![Channel::Broker]));
    assert_eq!(h.broker.last_payload(), json!({"door": "open"}));
}

// ═══════════════════════════════════════════════════════════════════════════
// Circuit breakers
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_breaker_opens_after_threshold_and_stops_calls() {
    let h = harness_with(BridgeConfig {
        node_id: NODE_ID.into(),
        breaker_threshold: 3,
        breaker_cooldown_ms: 60_000,
        ..Default::default()
    });
    h.broker.set_failing(true);

    for i in 0..3 {
        let wire = overlay_wire("socket", "node-other", json!(i));
        h.bridge.handle_inbound(Channel::Overlay, "t", &wire).await;
    }
    assert_eq!(h.bridge.breakers().get(Channel::Broker).state(), CircuitState::Open);
    assert_eq!(h.broker.publish_attempts.load(Ordering::SeqCst), 3);

    // Open: no attempt reaches the transport, but the drop is counted
    let wire = overlay_wire("socket", "node-other", json!(99));
    let d = h.bridge.handle_inbound(Channel::Overlay, "t", &wire).await;
    assert!(matches!(d, Disposition::Forwarded(ref r) if r.failed == vec![Channel::Broker]));
    assert_eq!(h.broker.publish_attempts.load(Ordering::SeqCst), 3);
    assert_eq!(h.bridge.stats().channel(Channel::Broker).failed, 4);

    // Other channels are unaffected
    assert_eq!(h.bridge.breakers().get(Channel::Overlay).state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_half_open_trial_call_closes_breaker_on_success() {
    let h = harness_with(BridgeConfig {
        node_id: NODE_ID.into(),
        breaker_threshold: 1,
        breaker_cooldown_ms: 20,
        ..Default::default()
    });
    h.overlay.set_failing(true);
    h.bridge.handle_inbound(Channel::Broker, "t", b"1").await;
    assert_eq!(h.bridge.breakers().get(Channel::Overlay).state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(40)).await;
    h.overlay.set_failing(false);
    let d = h.bridge.handle_inbound(Channel::Broker, "t", b"2").await;

    assert!(matches!(d, Disposition::Forwarded(ref r) if r.published == vec![Channel::Overlay]));
    let overlay = h.bridge.breakers().get(Channel::Overlay);
    assert_eq!(overlay.state(), CircuitState::Closed);
    assert_eq!(overlay.consecutive_failures(), 0);
}

#[tokio::test]
async fn test_half_open_trial_call_failure_reopens() {
    let h = harness_with(BridgeConfig {
        node_id: NODE_ID.into(),
        breaker_threshold: 1,
        breaker_cooldown_ms: 20,
        ..Default::default()
    });
    h.overlay.set_failing(true);
    h.bridge.handle_inbound(Channel::Broker, "t", b"1").await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    h.bridge.handle_inbound(Channel::Broker, "t", b"2").await;
    assert_eq!(h.overlay.publish_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(h.bridge.breakers().get(Channel::Overlay).state(), CircuitState::Open);

    h.bridge.handle_inbound(Channel::Broker, "t", b"3").await;
    assert_eq!(h.overlay.publish_attempts.load(Ordering::SeqCst), 2);
}

// ═══════════════════════════════════════════════════════════════════════════
// Local subscriptions
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_many_local_subscribers_share_one_upstream_subscription() {
    let h = harness();
    assert!(h.bridge.subscribe_local("s1", "chat").await.unwrap());
    assert!(!h.bridge.subscribe_local("s2", "chat").await.unwrap());
    assert!(!h.bridge.subscribe_local("s3", "chat").await.unwrap());

    assert_eq!(*h.overlay.subscribes.lock(), vec!["chat".to_string()]);
    assert_eq!(*h.broker.subscribes.lock(), vec!["chat".to_string()]);

    assert!(!h.bridge.unsubscribe_local("s1", "chat").await.unwrap());
    assert!(!h.bridge.unsubscribe_local("s2", "chat").await.unwrap());
    assert!(h.overlay.unsubscribes.lock().is_empty());

    assert!(h.bridge.unsubscribe_local("s3", "chat").await.unwrap());
    assert_eq!(*h.overlay.unsubscribes.lock(), vec!["chat".to_string()]);
    assert_eq!(*h.broker.unsubscribes.lock(), vec!["chat".to_string()]);
}

#[tokio::test]
async fn test_failed_upstream_subscribe_rolls_back_interest() {
    let h = harness();
    h.broker.refuse_subscribe.store(true, Ordering::SeqCst);

    let err = h.bridge.subscribe_local("s1", "chat").await.unwrap_err();

    assert!(matches!(err, TransportError::Subscription(_)));
    assert_eq!(*h.overlay.subscribes.lock(), vec!["chat".to_string()]);
    assert_eq!(*h.overlay.unsubscribes.lock(), vec!["chat".to_string()]);
    assert_eq!(h.bridge.subscriptions().topic_count(), 0);
}

#[tokio::test]
async fn test_failed_rollback_unsubscribe_is_recorded() {
    let h = harness();
    h.broker.refuse_subscribe.store(true, Ordering::SeqCst);
    h.overlay.refuse_unsubscribe.store(true, Ordering::SeqCst);

    assert!(h.bridge.subscribe_local("s1", "chat").await.is_err());

    // The overlay is still subscribed; the failure shows up in its counters
    assert_eq!(*h.overlay.subscribes.lock(), vec!["chat".to_string()]);
    assert!(h.overlay.unsubscribes.lock().is_empty());
    assert_eq!(h.bridge.subscriptions().topic_count(), 0);

    let overlay = h.bridge.stats().channel(Channel::Overlay);
    assert_eq!(overlay.failed, 1);
    assert!(overlay.last_error.unwrap().contains("connection lost"));
    assert!(overlay.last_error_at.is_some());
}

#[tokio::test]
async fn test_fan_out_only_reaches_topic_subscribers() {
    let h = harness();
    h.bridge.subscribe_local("s1", "chat").await.unwrap();
    h.bridge.subscribe_local("s2", "chat").await.unwrap();
    h.bridge.subscribe_local("s3", "news").await.unwrap();

    let d = h.bridge.handle_inbound(Channel::Broker, "chat", br#"{"text":"hi"}"#).await;

    assert!(matches!(d, Disposition::Forwarded(ref r) if r.local_recipients == 2));
    assert_eq!(h.sink.recipients(), vec!["s1", "s2"]);
    // Local subscribers get the data only
    assert_eq!(h.sink.emitted.lock()[0].2, json!({"text": "hi"}));
    assert_eq!(h.bridge.stats().channel(Channel::Local).broadcast, 2);
}

#[tokio::test]
async fn test_no_subscribers_is_not_a_broadcast() {
    let h = harness();
    h.bridge.handle_inbound(Channel::Broker, "quiet", b"1").await;

    assert!(h.sink.emitted.lock().is_empty());
    assert_eq!(h.bridge.stats().channel(Channel::Local).broadcast, 0);
}

#[tokio::test]
async fn test_disconnect_releases_only_orphaned_topics() {
    let h = harness();
    h.bridge.subscribe_local("s1", "a").await.unwrap();
    h.bridge.subscribe_local("s1", "b").await.unwrap();
    h.bridge.subscribe_local("s2", "b").await.unwrap();

    let released = h.bridge.disconnect_local("s1").await;

    assert_eq!(released, vec!["a".to_string()]);
    assert_eq!(*h.broker.unsubscribes.lock(), vec!["a".to_string()]);
    assert!(h.bridge.subscriptions().is_subscribed("b", "s2"));
}

// ═══════════════════════════════════════════════════════════════════════════
// Validation and housekeeping
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_validation_rejections_are_counted_not_forwarded() {
    let h = harness_with(BridgeConfig {
        node_id: NODE_ID.into(),
        max_message_size: 8,
        topic_blacklist: vec!["private".into()],
        ..Default::default()
    });

    let d = h.bridge.handle_inbound(Channel::Broker, "private/room", b"1").await;
    assert!(matches!(d, Disposition::Rejected(Rejection::Blacklisted { .. })));

    let d = h.bridge.handle_inbound(Channel::Broker, "t", b"\"far too long\"").await;
    assert!(matches!(d, Disposition::Rejected(Rejection::TooLarge { .. })));

    let d = h.bridge.handle_inbound(Channel::Broker, "", b"1").await;
    assert_eq!(d, Disposition::Rejected(Rejection::EmptyTopic));

    assert_eq!(h.bridge.stats().channel(Channel::Broker).rejected, 3);
    assert_eq!(h.bridge.stats().channel(Channel::Broker).received, 3);
    assert_eq!(h.overlay.publish_count(), 0);
}

#[tokio::test]
async fn test_disabled_channels_are_skipped() {
    let h = harness_with(BridgeConfig {
        node_id: NODE_ID.into(),
        enable_broker: false,
        ..Default::default()
    });

    let d = h.bridge.handle_inbound(Channel::Broker, "t", b"1").await;
    assert_eq!(d, Disposition::Ignored);

    h.bridge.handle_inbound(Channel::Local, "t", b"2").await;
    assert_eq!(h.overlay.publish_count(), 1);
    assert_eq!(h.broker.publish_count(), 0);
}

#[tokio::test]
async fn test_ingest_task_drains_channel() {
    let h = harness();
    let (tx, rx) = mpsc::channel(8);
    let task = h.bridge.spawn_ingest(Channel::Broker, rx);

    tx.send(InboundMessage::new("a", b"1".to_vec())).await.unwrap();
    tx.send(InboundMessage::new("b", b"2".to_vec())).await.unwrap();
    drop(tx);
    task.await.unwrap();

    assert_eq!(h.overlay.publish_count(), 2);
    assert_eq!(h.bridge.stats().channel(Channel::Broker).received, 2);
}

#[tokio::test]
async fn test_health_reflects_connectivity_and_breakers() {
    let h = harness_with(BridgeConfig {
        node_id: NODE_ID.into(),
        breaker_threshold: 1,
        ..Default::default()
    });
    assert!(h.bridge.health().healthy);

    h.broker.disconnected.store(true, Ordering::SeqCst);
    let health = h.bridge.health();
    assert!(!health.healthy);
    assert!(!health.channels.broker.healthy);

    h.broker.disconnected.store(false, Ordering::SeqCst);
    h.overlay.set_failing(true);
    h.bridge.handle_inbound(Channel::Broker, "t", b"1").await;
    let health = h.bridge.health();
    assert!(!health.healthy);
    assert_eq!(health.channels.overlay.circuit_breaker, CircuitState::Open);
    assert_eq!(health.channels.overlay.last_error.as_deref(), Some("publish failed: connection refused"));
}

#[tokio::test]
async fn test_metrics_snapshot_counts() {
    let h = harness();
    h.bridge.handle_inbound(Channel::Broker, "t", b"1").await;
    h.bridge.handle_inbound(Channel::Broker, "t", b"1").await;

    let snapshot = h.bridge.metrics();
    assert_eq!(snapshot.channels.broker.received, 2);
    assert_eq!(snapshot.channels.broker.duplicates, 1);
    assert_eq!(snapshot.channels.overlay.published, 1);
    assert_eq!(snapshot.loops_prevented, 1);
    assert_eq!(snapshot.circuit_breakers.len(), 3);
    assert_eq!(snapshot.rates.broker.error_rate, "0.00%");
}
