//! Event registry: maps an event type to the decoder producing its payload.
//!
//! Registration happens at startup, before any subscription exists. Lookups
//! happen on the transport's delivery path, so the map sits behind a
//! read/write lock and decoders are handed out as cheap `Arc` clones.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use tracing::debug;

use super::{Event, EventType};
use crate::bus::{BusError, Result};

/// Decodes a wire payload into a fresh event instance.
pub type EventDecoder =
    Arc<dyn Fn(&[u8]) -> std::result::Result<Box<dyn Event>, serde_json::Error> + Send + Sync>;

/// Registry of known event types.
#[derive(Default)]
pub struct EventRegistry {
    decoders: RwLock<HashMap<EventType, EventDecoder>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `E` as the payload for `event_type`, decoded from JSON.
    pub fn register_event<E>(&self, event_type: impl Into<EventType>) -> Result<()>
    where
        E: Event + DeserializeOwned + 'static,
    {
        let decoder: EventDecoder = Arc::new(|payload: &[u8]| {
            let event: E = serde_json::from_slice(payload)?;
            Ok(Box::new(event) as Box<dyn Event>)
        });
        self.register_decoder(event_type, decoder)
    }

    /// Register a custom decoder for `event_type`.
    pub fn register_decoder(
        &self,
        event_type: impl Into<EventType>,
        decoder: EventDecoder,
    ) -> Result<()> {
        let event_type = event_type.into();
        let mut decoders = self
            .decoders
            .write()
            .map_err(|_| BusError::Poisoned("event registry"))?;

        if decoders.contains_key(&event_type) {
            return Err(BusError::DuplicateEventRegistration(event_type));
        }

        debug!(event_type = %event_type, "Event type registered");
        decoders.insert(event_type, decoder);
        Ok(())
    }

    /// Look up the decoder for `event_type`.
    pub fn decoder(&self, event_type: &EventType) -> Result<EventDecoder> {
        let decoders = self
            .decoders
            .read()
            .map_err(|_| BusError::Poisoned("event registry"))?;

        decoders
            .get(event_type)
            .cloned()
            .ok_or_else(|| BusError::UnknownEventType(event_type.clone()))
    }

    pub fn contains(&self, event_type: &EventType) -> bool {
        self.decoders
            .read()
            .map(|decoders| decoders.contains_key(event_type))
            .unwrap_or(false)
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<EventType> {
        let mut types: Vec<EventType> = self
            .decoders
            .read()
            .map(|decoders| decoders.keys().cloned().collect())
            .unwrap_or_default();
        types.sort();
        types
    }
}
