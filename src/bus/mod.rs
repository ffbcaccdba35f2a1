//! Event bus over a persistent broker connection.
//!
//! This module contains:
//! - `EventBus`: the context object owning registry, metrics, subscriptions
//!   and the broker connection
//! - `EventHandler` trait: For processing decoded events
//! - Error types for bus operations and handlers
//!
//! Initialization order is fixed by [`EventBusBuilder`]: metrics and the
//! registry exist before the connection manager starts delivering messages.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use ::metrics::Recorder;
use serde::Serialize;
use tracing::info;

use crate::config::{Config, ConfigError};
use crate::event::{Event, EventRegistry, EventType};
use crate::transport::{ConnectCallback, Qos, Transport, TransportError};
use crate::utils::bootstrap::interrupt_signal;

pub mod connection;
pub mod dispatch;
pub mod metrics;
pub mod publisher;
pub mod subscription;

pub use connection::{ConnectPolicy, ConnectionManager};
pub use dispatch::{DispatchTarget, Dispatcher, HandlerOutcome};
pub use metrics::MetricsCollector;
pub use publisher::Publisher;
pub use subscription::{Subscription, SubscriptionKey, SubscriptionManager};


// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Event type '{0}' is already registered")]
    DuplicateEventRegistration(EventType),

    #[error("Event type '{0}' is not registered")]
    UnknownEventType(EventType),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Subscribe to '{topic}' failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Publish to '{topic}' failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Connection failed: {0}")]
    Connect(#[source] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Lock poisoned: {0}")]
    Poisoned(&'static str),
}

/// Error returned by an event handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Expected business condition the handler already dealt with.
    #[error("{0}")]
    Domain(String),

    /// Anything else; reported as an operational failure.
    #[error(transparent)]
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn domain(message: impl Into<String>) -> Self {
        Self::Domain(message.into())
    }

    pub fn failed(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Failed(error.into())
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, Self::Domain(_))
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler for processing events from the bus.
pub trait EventHandler: Send + Sync {
    /// Process one decoded event.
    ///
    /// Runs on its own task; returning a domain error suppresses logging.
    fn handle(&self, event: Arc<dyn Event>)
        -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct HandlerFn<F>(F);

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Arc<dyn Event>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

impl<F, Fut> EventHandler for HandlerFn<F>
where
    F: Fn(Arc<dyn Event>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        event: Arc<dyn Event>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin((self.0)(event))
    }
}

// ============================================================================
// Context
// ============================================================================

/// Typed publish/subscribe over one broker connection.
///
/// Cloning is cheap; all clones share the same connection and state.
#[derive(Clone)]
pub struct EventBus {
    client_id: Arc<str>,
    registry: Arc<EventRegistry>,
    metrics: MetricsCollector,
    subscriptions: Arc<SubscriptionManager>,
    dispatcher: Arc<Dispatcher>,
    publisher: Publisher,
    connection: Arc<ConnectionManager>,
}

impl EventBus {
    pub fn builder(config: Config) -> EventBusBuilder {
        EventBusBuilder::new(config)
    }

    /// Register a payload type under `event_type`.
    ///
    /// Complete registration before subscribing to the type.
    pub fn register_event<E>(&self, event_type: impl Into<EventType>) -> Result<()>
    where
        E: Event + serde::de::DeserializeOwned + 'static,
    {
        self.registry.register_event::<E>(event_type)
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    /// Subscribe `handler` to `topic`, decoding messages as `event_type`.
    ///
    /// On success the subscription is tracked and replayed after every
    /// reconnect. A subscription on the same topic with another event type
    /// is replaced.
    pub async fn subscribe<H>(
        &self,
        event_type: impl Into<EventType>,
        topic: &str,
        qos: Qos,
        handler: H,
    ) -> Result<()>
    where
        H: EventHandler + 'static,
    {
        self.subscriptions
            .subscribe(event_type.into(), topic, qos, Arc::new(handler))
            .await
    }

    /// Publish `event` to `topic`, waiting for the broker acknowledgement.
    pub async fn publish<E>(&self, topic: &str, event: &E, qos: Qos, retained: bool) -> Result<()>
    where
        E: Event + Serialize,
    {
        self.publisher.publish(topic, event, qos, retained).await
    }

    /// Snapshot of the tracked subscriptions, ordered by topic.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.subscriptions()
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Handler invocations spawned but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Resolves once shutdown has disconnected and drained the handlers.
    pub async fn closed(&self) {
        self.connection.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }
}

/// Builder for [`EventBus`].
pub struct EventBusBuilder {
    config: Config,
    client_id: String,
    policy: ConnectPolicy,
    recorder: Option<Arc<dyn Recorder + Send + Sync>>,
    shutdown: Option<BoxFuture<'static, ()>>,
}

impl EventBusBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            client_id: String::new(),
            policy: ConnectPolicy::default(),
            recorder: None,
            shutdown: None,
        }
    }

    /// Client identity used when the configuration leaves it empty.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn connect_policy(mut self, policy: ConnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Record metrics into `recorder` instead of the global one.
    pub fn metrics_recorder(mut self, recorder: Arc<dyn Recorder + Send + Sync>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Future that triggers shutdown. Defaults to the process interrupt.
    pub fn shutdown_signal(mut self, signal: impl Future<Output = ()> + Send + 'static) -> Self {
        self.shutdown = Some(Box::pin(signal));
        self
    }

    /// Connect to the configured MQTT brokers.
    #[cfg(feature = "mqtt")]
    pub async fn connect(self) -> Result<EventBus> {
        self.config.validate()?;
        let client_id = self.config.mqtt.resolve_client_id(&self.client_id);
        let transport = Arc::new(crate::transport::MqttTransport::new(
            self.config.mqtt.clone(),
            client_id,
        ));
        self.connect_with(transport).await
    }

    /// Connect over an explicit transport.
    pub async fn connect_with(self, transport: Arc<dyn Transport>) -> Result<EventBus> {
        let Self {
            config,
            client_id,
            policy,
            recorder,
            shutdown,
        } = self;

        config.validate()?;
        let client_id = config.mqtt.resolve_client_id(&client_id);

        let metrics = match recorder {
            Some(recorder) => MetricsCollector::register_with(
                recorder,
                &config.metrics.namespace,
                &config.metrics.subsystem,
                config.cluster_id.clone(),
            ),
            None => MetricsCollector::register(
                &config.metrics.namespace,
                &config.metrics.subsystem,
                config.cluster_id.clone(),
            ),
        };

        let registry = Arc::new(EventRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(metrics.clone(), &config.dispatch));
        let subscriptions = Arc::new(SubscriptionManager::new(
            transport.clone(),
            registry.clone(),
            dispatcher.clone(),
        ));
        let connection = Arc::new(ConnectionManager::new(
            transport.clone(),
            client_id.clone(),
            Duration::from_millis(config.mqtt.disconnect_quiesce_ms),
        ));

        connection
            .attach(resubscribe_on_connect(&subscriptions))
            .await;
        connection.connect(&policy).await?;

        let shutdown = shutdown.unwrap_or_else(|| Box::pin(interrupt_signal()));
        connection.spawn_shutdown_watcher(shutdown, dispatcher.clone());

        info!(client_id = %client_id, cluster = %config.cluster_id, "Event bus initialized");

        Ok(EventBus {
            client_id: client_id.into(),
            registry,
            publisher: Publisher::new(transport, metrics.clone()),
            metrics,
            subscriptions,
            dispatcher,
            connection,
        })
    }
}

/// On-connect observer replaying tracked subscriptions after a reconnect.
///
/// The first connection happens before anything can subscribe, so it is
/// skipped. Holds the manager weakly; the transport owning the observer must
/// not keep the manager alive.
fn resubscribe_on_connect(subscriptions: &Arc<SubscriptionManager>) -> ConnectCallback {
    let subscriptions = Arc::downgrade(subscriptions);
    let runtime = tokio::runtime::Handle::current();
    let first_connect = AtomicBool::new(true);
    Arc::new(move || {
        if first_connect.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(subscriptions) = subscriptions.upgrade() else {
            return;
        };
        runtime.spawn(async move {
            subscriptions.resubscribe_all().await;
        });
    })
}
