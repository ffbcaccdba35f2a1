//! mqtt-events - typed event publish/subscribe over MQTT
//!
//! Registers typed event payloads, subscribes handlers to broker topics,
//! decodes and dispatches inbound messages concurrently, replays
//! subscriptions after reconnects and reports produce/consume metrics.
//!
//! ```no_run
//! use mqtt_events::{Config, EventBus};
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let _bus = EventBus::builder(Config::load(None)?).connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod event;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use bus::{
    handler_fn, BusError, ConnectPolicy, EventBus, EventBusBuilder, EventHandler, HandlerError,
    MetricsCollector,
};
pub use config::Config;
pub use event::{Event, EventRegistry, EventType, Header};
pub use transport::{Qos, Transport, TransportError};
