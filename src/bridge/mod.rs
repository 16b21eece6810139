// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Multi-transport message bridge.
//!
//! Relays pub/sub traffic between the peer overlay, an external broker and
//! local realtime subscribers. Each node keeps its own loop guard, breakers
//! and subscription table; nothing here coordinates with other nodes.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nodeweave::bridge::{Channel, LocalSink, NullTransport, TransportBridge, TransportError};
//! use nodeweave::BridgeConfig;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl LocalSink for Printer {
//!     async fn emit(&self, who: &str, topic: &str, msg: &serde_json::Value) -> Result<(), TransportError> {
//!         println!("{who} <- {topic}: {msg}");
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bridge = TransportBridge::new(
//!     BridgeConfig::default(),
//!     Arc::new(NullTransport),
//!     Arc::new(NullTransport),
//!     Arc::new(Printer),
//! );
//! bridge.subscribe_local("client-1", "chat").await.unwrap();
//! bridge.handle_inbound(Channel::Broker, "chat", br#"{"text":"hi"}"#).await;
//! println!("{}", serde_json::to_string_pretty(&bridge.metrics()).unwrap());
//! # }
//! ```

pub mod core;
pub mod envelope;
pub mod loop_guard;
pub mod stats;
pub mod subscriptions;
pub mod transport;
pub mod validation;

pub use self::core::{Disposition, ForwardReport, InboundMessage, TransportBridge};
pub use envelope::{BridgeMessage, Channel};
pub use loop_guard::LoopGuard;
pub use stats::{ChannelHealth, ChannelRates, ChannelStats, HealthSnapshot, MetricsCollector, MetricsSnapshot, PerChannel};
pub use subscriptions::SubscriptionRegistry;
pub use transport::{LocalSink, NullTransport, Transport, TransportError};
pub use validation::{MessageValidator, Rejection};
