//! Broker transport abstraction.
//!
//! This module contains:
//! - `Transport` trait: connect/disconnect, subscribe, publish and connection observers
//! - `Qos`: delivery guarantee passed through to the broker
//! - Implementations: MQTT (rumqttc), Mock

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

pub mod mock;
#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use mock::MockTransport;
#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised by the broker transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Request rejected by broker: {0}")]
    Rejected(String),

    #[error("Timed out after {0:?} waiting for broker acknowledgement")]
    Timeout(Duration),

    #[error("Client error: {0}")]
    Client(String),
}

/// Quality of service for subscribe and publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Qos {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        qos as u8
    }
}

impl TryFrom<u8> for Qos {
    type Error = TransportError;

    fn try_from(level: u8) -> Result<Self> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(TransportError::Client(format!("invalid QoS level {}", other))),
        }
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// A message delivered by the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retained: bool,
}

/// Invoked by the transport for every inbound message on a subscribed filter.
///
/// Runs on the transport's delivery task and must not block.
pub type MessageCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Invoked on every successful connection, including reconnects.
pub type ConnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Invoked whenever an established connection is lost.
pub type ConnectionLostCallback = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Connection lifecycle observers attached before connecting.
#[derive(Clone)]
pub struct ConnectionObservers {
    pub on_connect: ConnectCallback,
    pub on_connection_lost: ConnectionLostCallback,
}

impl Default for ConnectionObservers {
    fn default() -> Self {
        Self {
            on_connect: Arc::new(|| {}),
            on_connection_lost: Arc::new(|_| {}),
        }
    }
}

impl fmt::Debug for ConnectionObservers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionObservers").finish_non_exhaustive()
    }
}

/// Interface to the message broker.
///
/// Implementations:
/// - `MqttTransport`: MQTT 3.1.1 via rumqttc
/// - `MockTransport`: In-memory mock for testing
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attach lifecycle observers. Must be called before `connect`.
    async fn set_observers(&self, observers: ConnectionObservers);

    /// Establish the broker connection. Keeps reconnecting afterwards.
    async fn connect(&self) -> Result<()>;

    /// Disconnect, waiting at most `quiesce` for in-flight work to settle.
    async fn disconnect(&self, quiesce: Duration) -> Result<()>;

    /// Subscribe to a topic filter, blocking until the broker acknowledges.
    ///
    /// Subscribing the same filter again replaces its callback.
    async fn subscribe(&self, topic: &str, qos: Qos, callback: MessageCallback) -> Result<()>;

    /// Publish a payload, blocking until the broker acknowledges per `qos`.
    async fn publish(&self, topic: &str, qos: Qos, retained: bool, payload: Vec<u8>)
        -> Result<()>;
}

/// Check if a topic matches an MQTT topic filter.
///
/// Matching rules:
/// - "+" matches exactly one level
/// - "#" matches any number of remaining levels (including the parent level)
/// - Topics starting with "$" are not matched by a leading wildcard
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
