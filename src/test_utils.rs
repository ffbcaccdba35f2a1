//! Test utilities shared by the unit tests.
//!
//! Provides a sample event type, recording handlers, a metrics probe backed by
//! `metrics-util`'s debugging recorder and an in-memory log capture.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use metrics::Recorder;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use metrics_util::CompositeKey;
use serde::{Deserialize, Serialize};

use crate::bus::{EventHandler, HandlerError, MetricsCollector};
use crate::event::{Event, EventType, Header};

pub const ORDER_CREATED: &str = "order.created";

/// Sample event used across tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreated {
    #[serde(flatten)]
    pub header: Header,
    pub id: String,
}

impl OrderCreated {
    pub fn new(id: &str) -> Self {
        Self {
            header: Header::new(ORDER_CREATED, 1),
            id: id.to_string(),
        }
    }

    /// Wire payload with an explicit `created_at`.
    pub fn payload(id: &str, created_at: i64) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "type": ORDER_CREATED,
            "version": 1,
            "created_at": created_at,
            "id": id,
        }))
        .unwrap()
    }
}

impl Event for OrderCreated {
    fn event_type(&self) -> EventType {
        EventType::new(ORDER_CREATED)
    }

    fn header(&self) -> &Header {
        &self.header
    }
}

/// Handler that records the ids of the orders it sees.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    ids: Arc<Mutex<Vec<String>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Vec<String> {
        self.ids.lock().unwrap().clone()
    }
}

impl EventHandler for RecordingHandler {
    fn handle(&self, event: Arc<dyn Event>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let ids = self.ids.clone();
        Box::pin(async move {
            if let Some(order) = event.downcast_ref::<OrderCreated>() {
                ids.lock().unwrap().push(order.id.clone());
            }
            Ok(())
        })
    }
}

/// Handler that always fails with the given error.
pub struct FailingHandler {
    domain: bool,
}

impl FailingHandler {
    pub fn domain() -> Self {
        Self { domain: true }
    }

    pub fn technical() -> Self {
        Self { domain: false }
    }
}

impl EventHandler for FailingHandler {
    fn handle(&self, _event: Arc<dyn Event>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let domain = self.domain;
        Box::pin(async move {
            if domain {
                Err(HandlerError::domain("order already shipped"))
            } else {
                Err(HandlerError::failed(io::Error::other("database unavailable")))
            }
        })
    }
}

/// Metrics recorder whose observations can be read back.
///
/// Snapshots drain histogram samples, so every sample seen is kept here and
/// reads can be repeated in any order.
pub struct MetricsProbe {
    recorder: Arc<DebuggingRecorder>,
    snapshotter: Snapshotter,
    samples: Mutex<HashMap<CompositeKey, Vec<f64>>>,
}

enum Observed {
    Count(u64),
    Samples(Vec<f64>),
    Other,
}

impl MetricsProbe {
    pub fn new() -> Self {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        Self {
            recorder: Arc::new(recorder),
            snapshotter,
            samples: Mutex::new(HashMap::new()),
        }
    }

    pub fn recorder(&self) -> Arc<dyn Recorder + Send + Sync> {
        self.recorder.clone()
    }

    pub fn collector(&self, namespace: &str, subsystem: &str, cluster: &str) -> MetricsCollector {
        MetricsCollector::register_with(self.recorder(), namespace, subsystem, cluster)
    }

    /// Counter value for `name` with the given `topic` label.
    pub fn counter(&self, name: &str, topic: &str) -> u64 {
        self.counter_with(name, &[("topic", topic)])
    }

    /// Counter value for `name` whose labels include every pair in `labels`.
    pub fn counter_with(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.observe(name, labels)
            .into_iter()
            .map(|value| match value {
                Observed::Count(count) => count,
                _ => 0,
            })
            .sum()
    }

    /// Every histogram sample recorded for `name` with the given `topic` label.
    pub fn histogram(&self, name: &str, topic: &str) -> Vec<f64> {
        self.observe(name, &[("topic", topic)])
            .into_iter()
            .flat_map(|value| match value {
                Observed::Samples(samples) => samples,
                _ => Vec::new(),
            })
            .collect()
    }

    fn observe(&self, name: &str, labels: &[(&str, &str)]) -> Vec<Observed> {
        let mut kept = self.samples.lock().unwrap();
        self.snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, value)| {
                let value = match value {
                    DebugValue::Counter(count) => Observed::Count(count),
                    DebugValue::Histogram(samples) => {
                        let all = kept.entry(key.clone()).or_default();
                        all.extend(samples.into_iter().map(|sample| sample.0));
                        Observed::Samples(all.clone())
                    }
                    _ => Observed::Other,
                };
                (key, value)
            })
            .filter(|(key, _)| {
                let key = key.key();
                key.name() == name
                    && labels.iter().all(|(k, v)| {
                        key.labels()
                            .any(|label| label.key() == *k && label.value() == *v)
                    })
            })
            .map(|(_, value)| value)
            .collect()
    }
}

/// In-memory sink for formatted log lines.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a subscriber writing into this capture for the current thread.
    ///
    /// Only sees tasks polled on this thread, so pair it with a current-thread runtime.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let capture = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || capture.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
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
