//! Shared utilities for integration tests.
//!
//! Provides sample events, a recording handler and a bus wired to the mock
//! transport with an inspectable metrics recorder.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use mqtt_events::transport::MockTransport;
use mqtt_events::{
    Config, ConnectPolicy, Event, EventBus, EventHandler, EventType, HandlerError, Header,
};

pub const ORDER_PLACED: &str = "order.placed";
pub const PAYMENT_CAPTURED: &str = "payment.captured";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlaced {
    #[serde(flatten)]
    pub header: Header,
    pub order_id: String,
    pub total_cents: u64,
}

impl OrderPlaced {
    pub fn new(order_id: &str, total_cents: u64) -> Self {
        Self {
            header: Header::new(ORDER_PLACED, 1),
            order_id: order_id.to_string(),
            total_cents,
        }
    }
}

impl Event for OrderPlaced {
    fn event_type(&self) -> EventType {
        EventType::new(ORDER_PLACED)
    }

    fn header(&self) -> &Header {
        &self.header
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCaptured {
    #[serde(flatten)]
    pub header: Header,
    pub order_id: String,
}

impl PaymentCaptured {
    pub fn new(order_id: &str) -> Self {
        Self {
            header: Header::new(PAYMENT_CAPTURED, 2),
            order_id: order_id.to_string(),
        }
    }
}

impl Event for PaymentCaptured {
    fn event_type(&self) -> EventType {
        EventType::new(PAYMENT_CAPTURED)
    }

    fn header(&self) -> &Header {
        &self.header
    }
}

/// Records the order id of every event it handles.
#[derive(Clone, Default)]
pub struct Collector {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Collector {
    pub fn seen(&self) -> Vec<String> {
        let mut seen = self.seen.lock().unwrap().clone();
        seen.sort();
        seen
    }
}

impl EventHandler for Collector {
    fn handle(&self, event: Arc<dyn Event>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let seen = self.seen.clone();
        Box::pin(async move {
            let id = if let Some(order) = event.downcast_ref::<OrderPlaced>() {
                order.order_id.clone()
            } else if let Some(payment) = event.downcast_ref::<PaymentCaptured>() {
                format!("payment:{}", payment.order_id)
            } else {
                return Err(HandlerError::failed("unexpected event"));
            };
            seen.lock().unwrap().push(id);
            Ok(())
        })
    }
}

/// Event bus over the mock transport, shut down through a oneshot.
pub struct TestBus {
    pub bus: EventBus,
    pub transport: Arc<MockTransport>,
    snapshotter: Snapshotter,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestBus {
    pub async fn start() -> Self {
        Self::start_with(Config::for_test()).await
    }

    pub async fn start_with(config: Config) -> Self {
        let transport = Arc::new(MockTransport::new());
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let (trigger, signal) = oneshot::channel::<()>();

        let bus = EventBus::builder(config)
            .client_id("integration")
            .connect_policy(ConnectPolicy::Propagate)
            .metrics_recorder(Arc::new(recorder))
            .shutdown_signal(async move {
                let _ = signal.await;
            })
            .connect_with(transport.clone())
            .await
            .expect("bus should connect over the mock transport");

        Self {
            bus,
            transport,
            snapshotter,
            shutdown: Some(trigger),
        }
    }

    /// Trigger shutdown and wait until the bus reports closed.
    pub async fn shutdown(&mut self) {
        if let Some(trigger) = self.shutdown.take() {
            let _ = trigger.send(());
        }
        self.bus.closed().await;
    }

    /// Sum of counter `name` over series labelled with `topic`.
    pub fn counter(&self, name: &str, topic: &str) -> u64 {
        self.snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| {
                key.key().name() == name
                    && key
                        .key()
                        .labels()
                        .any(|label| label.key() == "topic" && label.value() == topic)
            })
            .map(|(_, _, _, value)| match value {
                DebugValue::Counter(count) => count,
                _ => 0,
            })
            .sum()
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
