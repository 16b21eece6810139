// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Seams to the transports the bridge relays between.
//!
//! The overlay and broker clients, and the local realtime server, live
//! outside this crate. Adapters implement these traits and push inbound
//! traffic into [`TransportBridge::handle_inbound`](super::TransportBridge::handle_inbound)
//! or an ingest channel.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscription change failed: {0}")]
    Subscription(String),

    #[error("local delivery failed: {0}")]
    Delivery(String),
}

/// An upstream pub/sub plane (overlay or broker).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish raw bytes on a topic. `qos` is the broker delivery level;
    /// transports without the notion ignore it.
    async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

/// Delivery to one local realtime subscriber.
#[async_trait]
pub trait LocalSink: Send + Sync {
    async fn emit(&self, subscriber: &str, topic: &str, message: &Value) -> Result<(), TransportError>;
}

/// A transport that drops everything, for disabled channels.
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn publish(&self, _topic: &str, _payload: &[u8], _qos: u8) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }

    async fn subscribe(&self, _topic: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn unsubscribe(&self, _topic: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        false
    }
}
