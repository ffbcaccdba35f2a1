//! mqtt-events-tail: log every event seen on a topic
//!
//! Connects with the standard configuration, subscribes to one topic filter
//! and logs each event's envelope and body. Runs until interrupted.
//!
//! ## Configuration
//! - MQTT_EVENTS_CONFIG: Path to a YAML configuration file (optional)
//! - MQTT_EVENTS_TAIL_TOPIC: Topic filter to follow (default: `#`)
//! - MQTT_EVENTS_LOG: Log filter (default: `info`)

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use mqtt_events::event::Header;
use mqtt_events::utils::bootstrap::init_tracing;
use mqtt_events::{handler_fn, Config, Event, EventBus, EventType, HandlerError, Qos};

const TOPIC_ENV_VAR: &str = "MQTT_EVENTS_TAIL_TOPIC";
const DEFAULT_TOPIC: &str = "#";
const TAIL_EVENT_TYPE: &str = "mqtt-events-tail.any";

/// Any event: the envelope plus whatever body fields it carries.
#[derive(Debug, Serialize, Deserialize)]
struct LoggedEvent {
    #[serde(flatten)]
    header: Header,
    #[serde(flatten)]
    body: Map<String, Value>,
}

impl Event for LoggedEvent {
    fn event_type(&self) -> EventType {
        EventType::new(self.header.type_name.clone())
    }

    fn header(&self) -> &Header {
        &self.header
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let topic = std::env::var(TOPIC_ENV_VAR).unwrap_or_else(|_| DEFAULT_TOPIC.to_string());

    let bus = EventBus::builder(config)
        .client_id(format!("mqtt-events-tail-{}", std::process::id()))
        .connect()
        .await?;
    bus.register_event::<LoggedEvent>(TAIL_EVENT_TYPE)?;

    let handler = handler_fn(|event: Arc<dyn Event>| async move {
        if let Some(logged) = event.downcast_ref::<LoggedEvent>() {
            let age_ms = logged.header.age().map(|age| age.as_millis());
            let expired = Event::expired(logged);
            let body = Value::Object(logged.body.clone());
            info!(
                event_type = %logged.header.type_name,
                version = logged.header.version,
                message_id = ?logged.header.message_id,
                age_ms = ?age_ms,
                expired,
                body = %body,
                "Event"
            );
        }
        Ok::<(), HandlerError>(())
    });
    bus.subscribe(TAIL_EVENT_TYPE, &topic, Qos::AtLeastOnce, handler)
        .await?;

    info!(topic = %topic, client_id = %bus.client_id(), "mqtt-events-tail started");

    bus.closed().await;
    Ok(())
}
