//! Outbound event publishing.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error};

use super::{BusError, MetricsCollector, Result};
use crate::event::Event;
use crate::transport::{Qos, Transport};

/// Serializes events and publishes them, recording producer metrics.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    metrics: MetricsCollector,
}

impl Publisher {
    pub fn new(transport: Arc<dyn Transport>, metrics: MetricsCollector) -> Self {
        Self { transport, metrics }
    }

    /// Publish `event` to `topic` and wait for the broker acknowledgement.
    ///
    /// Serialization failures return before anything reaches the broker and
    /// are not counted as produce errors.
    pub async fn publish<E>(&self, topic: &str, event: &E, qos: Qos, retained: bool) -> Result<()>
    where
        E: Event + Serialize,
    {
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    topic = %topic,
                    event_type = %event.event_type(),
                    error = %e,
                    "Cannot serialize event"
                );
                return Err(e.into());
            }
        };

        let started = Instant::now();
        if let Err(source) = self.transport.publish(topic, qos, retained, payload).await {
            let reason = source.to_string();
            error!(
                topic = %topic,
                event_type = %event.event_type(),
                error = %reason,
                "Publish failed"
            );
            self.metrics.count_producer_error(topic, &reason);
            return Err(BusError::Publish {
                topic: topic.to_string(),
                source,
            });
        }

        let latency = started.elapsed();
        self.metrics.observe_producer_latency(topic, latency);
        self.metrics.count_produced(topic);
        debug!(
            topic = %topic,
            event_type = %event.event_type(),
            latency_ms = %latency.as_millis(),
            "Event published"
        );
        Ok(())
    }
}
