//! Event model.
//!
//! Every payload travelling over the bus shares a common envelope ([`Header`])
//! flattened next to its body fields:
//!
//! ```text
//! {"type":"order.created","version":1,"created_at":1700000000000000000,"id":"o-1"}
//! ```
//!
//! Application payloads implement [`Event`] and are registered with the
//! [`EventRegistry`] so inbound messages can be decoded into them.

pub mod registry;

pub use registry::{EventDecoder, EventRegistry};

use std::any::Any;
use std::fmt;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Opaque event type identifier (e.g. `"order.created"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Common envelope carried by every event.
///
/// Timestamps are epoch nanoseconds. `created_at` is stamped by the producer
/// and is what end-to-end latency is measured against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub version: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl Header {
    /// Create a header stamped with the current time.
    pub fn new(type_name: impl Into<String>, version: i32) -> Self {
        Self {
            type_name: type_name.into(),
            version,
            created_at: now_nanos(),
            expiry: None,
            message_id: None,
        }
    }

    /// Expire the event `ttl` after its creation time.
    pub fn with_expiry(mut self, ttl: Duration) -> Self {
        let ttl = i64::try_from(ttl.as_nanos()).unwrap_or(i64::MAX);
        self.expiry = Some(self.created_at.saturating_add(ttl));
        self
    }

    pub fn with_message_id(mut self, id: i64) -> Self {
        self.message_id = Some(id);
        self
    }

    /// Whether the expiry timestamp has passed. Events without one never expire.
    pub fn is_expired(&self) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now_nanos())
    }

    /// Time elapsed since `created_at`, or `None` when the producer did not
    /// stamp one. Negative values caused by clock skew clamp to zero.
    pub fn age(&self) -> Option<Duration> {
        if self.created_at <= 0 {
            return None;
        }
        let elapsed = now_nanos().saturating_sub(self.created_at).max(0);
        Some(Duration::from_nanos(elapsed as u64))
    }
}

/// Current wall-clock time in epoch nanoseconds.
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Object-safe access to `Any` for every `'static` type.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A typed event payload.
///
/// Inbound events are decoded into a fresh instance per message; handlers
/// receive it behind an `Arc<dyn Event>` and use [`downcast_ref`](dyn Event::downcast_ref)
/// to get at the concrete type.
pub trait Event: AsAny + fmt::Debug + Send + Sync {
    fn event_type(&self) -> EventType;

    fn header(&self) -> &Header;

    fn body(&self) -> &dyn Any {
        self.as_any()
    }

    fn expired(&self) -> bool {
        self.header().is_expired()
    }
}

impl dyn Event {
    pub fn downcast_ref<E: Event + 'static>(&self) -> Option<&E> {
        AsAny::as_any(self).downcast_ref::<E>()
    }

    pub fn is<E: Event + 'static>(&self) -> bool {
        AsAny::as_any(self).is::<E>()
    }
}
