// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Channel identities and the overlay envelope.
//!
//! Messages crossing the overlay carry a small wrapper so that a node can
//! recognise its own relays when they come back around:
//!
//! ```json
//! { "__origin": "mqtt", "__broker": "<node id>", "__timestamp": 1700000000000, "data": { ... } }
//! ```
//!
//! The wire names for origins (`libp2p`, `mqtt`, `socket`) are what other
//! nodes on the overlay already emit, so they are kept as-is. Broker and local
//! subscribers only ever see `data`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One of the three transport planes the bridge relays between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Channel {
    /// Peer-to-peer pub/sub overlay
    Overlay,
    /// External message broker
    Broker,
    /// Local realtime client connections
    Local,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Overlay, Channel::Broker, Channel::Local];

    /// Name used in logs, metrics labels and snapshots.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overlay => "overlay",
            Self::Broker => "broker",
            Self::Local => "local",
        }
    }

    /// Name used in the `__origin` envelope field.
    #[must_use]
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Overlay => "libp2p",
            Self::Broker => "mqtt",
            Self::Local => "socket",
        }
    }

    #[must_use]
    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Overlay => 0,
            Self::Broker => 1,
            Self::Local => 2,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown channel '{0}'")]
pub struct UnknownChannel(pub String);

impl FromStr for Channel {
    type Err = UnknownChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "libp2p" | "overlay" => Ok(Self::Overlay),
            "mqtt" | "broker" => Ok(Self::Broker),
            "socket" | "local" => Ok(Self::Local),
            other => Err(UnknownChannel(other.to_string())),
        }
    }
}

impl TryFrom<String> for Channel {
    type Error = UnknownChannel;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.wire_name().to_string()
    }
}

/// The overlay envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeMessage {
    #[serde(rename = "__origin")]
    pub origin: Channel,

    /// Broker-plane identity of the node that relayed the message
    #[serde(rename = "__broker", default, skip_serializing_if = "Option::is_none")]
    pub originator: Option<String>,

    /// Unix epoch milliseconds at wrap time
    #[serde(rename = "__timestamp", default)]
    pub sent_at: i64,

    #[serde(default)]
    pub data: Value,
}

impl BridgeMessage {
    pub fn wrap(origin: Channel, originator: Option<String>, data: Value) -> Self {
        Self {
            origin,
            originator,
            sent_at: now_ms(),
            data,
        }
    }

    /// True when this node's own broker relay has come back around.
    #[must_use]
    pub fn is_echo_of(&self, node_id: &str) -> bool {
        self.origin == Channel::Broker && self.originator.as_deref() == Some(node_id)
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Parse an inbound payload: JSON if it parses, otherwise the bytes as a string.
#[must_use]
pub fn parse_payload(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Split an overlay payload into its envelope (if it carries one) and the data.
///
/// A payload with an `__origin` field that does not deserialize as an
/// envelope is treated as plain data.
#[must_use]
pub fn unwrap_envelope(value: Value) -> (Option<BridgeMessage>, Value) {
    let is_enveloped = value.as_object().is_some_and(|obj| obj.contains_key("__origin"));
    if !is_enveloped {
        return (None, value);
    }
    match serde_json::from_value::<BridgeMessage>(value.clone()) {
        Ok(envelope) => {
            let data = envelope.data.clone();
            (Some(envelope), data)
        }
        Err(_) => (None, value),
    }
}

/// Serialize data for a transport. Strings go out raw, everything else as JSON.
#[must_use]
pub fn encode_data(data: &Value) -> Vec<u8> {
    match data {
        Value::String(s) => s.as_bytes().to_vec(),
        other => serde_json::to_vec(other).unwrap_or_default(),
    }
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_names() {
        assert_eq!(Channel::Overlay.as_str(), "overlay");
        assert_eq!(Channel::Broker.wire_name(), "mqtt");
        assert_eq!("socket".parse::<Channel>().unwrap(), Channel::Local);
        assert_eq!("broker".parse::<Channel>().unwrap(), Channel::Broker);
        assert!("carrier-pigeon".parse::<Channel>().is_err());
    }

    #[test]
    fn test_parse_payload_json_and_text() {
        assert_eq!(parse_payload(br#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(parse_payload(b"42"), json!(42));
        assert_eq!(parse_payload(b"hello world"), json!("hello world"));
    }

    #[test]
    fn test_envelope_wire_format() {
        let msg = BridgeMessage::wrap(Channel::Broker, Some("node-a".into()), json!({"t": 21.5}));
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["__origin"], "mqtt");
        assert_eq!(wire["__broker"], "node-a");
        assert_eq!(wire["data"], json!({"t": 21.5}));
        assert!(wire["__timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_unwrap_envelope() {
        let wire = json!({"__origin": "mqtt", "__broker": "node-a", "__timestamp": 1, "data": {"x": 1}});
        let (envelope, data) = unwrap_envelope(wire);
        let envelope = envelope.unwrap();
        assert_eq!(envelope.origin, Channel::Broker);
        assert!(envelope.is_echo_of("node-a"));
        assert!(!envelope.is_echo_of("node-b"));
        assert_eq!(data, json!({"x": 1}));
    }

    #[test]
    fn test_unwrap_plain_and_unknown_origin() {
        let (envelope, data) = unwrap_envelope(json!({"x": 1}));
        assert!(envelope.is_none());
        assert_eq!(data, json!({"x": 1}));

        let odd = json!({"__origin": "smoke-signal", "data": 1});
        let (envelope, data) = unwrap_envelope(odd.clone());
        assert!(envelope.is_none());
        assert_eq!(data, odd);
    }

    #[test]
    fn test_socket_origin_is_never_an_echo() {
        let msg = BridgeMessage::wrap(Channel::Local, Some("node-a".into()), json!(null));
        assert!(!msg.is_echo_of("node-a"));
    }

    #[test]
    fn test_encode_data() {
        assert_eq!(encode_data(&json!("raw text")), b"raw text".to_vec());
        assert_eq!(encode_data(&json!({"a": 1})), br#"{"a":1}"#.to_vec());
    }
}
