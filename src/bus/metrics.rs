//! Throughput, latency and error metrics for both directions.
//!
//! Emits through the `metrics` facade, either into the process-wide recorder
//! or into an explicit one handed to [`MetricsCollector::register_with`]:
//! - `mqtt_message_produced_count` - Messages published (by cluster, topic)
//! - `mqtt_messages_produce_errors_count` - Publish failures (by cluster, topic, error)
//! - `mqtt_message_produced_latency_milliseconds` - Publish acknowledgement latency
//! - `mqtt_message_count` - Messages consumed (by cluster, topic)
//! - `mqtt_message_end_to_end_latency_milliseconds` - Producer-to-consumer latency
//!
//! Names are prefixed with the namespace and subsystem when those are set.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use metrics::{Counter, Histogram, Key, Label, Level, Metadata, Recorder, Unit};
use tracing::info;

const PRODUCED_COUNT: &str = "mqtt_message_produced_count";
const PRODUCE_ERRORS_COUNT: &str = "mqtt_messages_produce_errors_count";
const PRODUCED_LATENCY: &str = "mqtt_message_produced_latency_milliseconds";
const CONSUMED_COUNT: &str = "mqtt_message_count";
const END_TO_END_LATENCY: &str = "mqtt_message_end_to_end_latency_milliseconds";

/// Where observations go.
#[derive(Clone)]
enum Sink {
    Global,
    Recorder(Arc<dyn Recorder + Send + Sync>),
}

/// Fully qualified metric names.
#[derive(Debug, Clone)]
struct MetricNames {
    produced: String,
    produce_errors: String,
    produced_latency: String,
    consumed: String,
    end_to_end_latency: String,
}

impl MetricNames {
    fn new(namespace: &str, subsystem: &str) -> Self {
        let prefix: String = [namespace, subsystem]
            .iter()
            .filter(|part| !part.is_empty())
            .map(|part| format!("{}_", part))
            .collect();

        Self {
            produced: format!("{}{}", prefix, PRODUCED_COUNT),
            produce_errors: format!("{}{}", prefix, PRODUCE_ERRORS_COUNT),
            produced_latency: format!("{}{}", prefix, PRODUCED_LATENCY),
            consumed: format!("{}{}", prefix, CONSUMED_COUNT),
            end_to_end_latency: format!("{}{}", prefix, END_TO_END_LATENCY),
        }
    }
}

/// Metrics for one cluster identity.
#[derive(Clone)]
pub struct MetricsCollector {
    names: Arc<MetricNames>,
    cluster: String,
    sink: Sink,
}

impl fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("names", &self.names)
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}

impl MetricsCollector {
    /// Describe the metrics against the process-wide recorder.
    pub fn register(namespace: &str, subsystem: &str, cluster: impl Into<String>) -> Self {
        Self::build(Sink::Global, namespace, subsystem, cluster.into())
    }

    /// Describe the metrics against an explicit recorder.
    pub fn register_with(
        recorder: Arc<dyn Recorder + Send + Sync>,
        namespace: &str,
        subsystem: &str,
        cluster: impl Into<String>,
    ) -> Self {
        Self::build(Sink::Recorder(recorder), namespace, subsystem, cluster.into())
    }

    fn build(sink: Sink, namespace: &str, subsystem: &str, cluster: String) -> Self {
        let collector = Self {
            names: Arc::new(MetricNames::new(namespace, subsystem)),
            cluster,
            sink,
        };
        collector.describe();
        info!(
            namespace = %namespace,
            subsystem = %subsystem,
            cluster = %collector.cluster,
            "MQTT metrics registered"
        );
        collector
    }

    fn describe(&self) {
        let names = self.names.clone();
        self.with_recorder(move |recorder| {
            recorder.describe_counter(
                names.produced.clone().into(),
                Some(Unit::Count),
                "Number of mqtt messages produced.".into(),
            );
            recorder.describe_counter(
                names.produce_errors.clone().into(),
                Some(Unit::Count),
                "Number of messages produce errors count.".into(),
            );
            recorder.describe_histogram(
                names.produced_latency.clone().into(),
                Some(Unit::Milliseconds),
                "Messages produced to broker latency in milliseconds".into(),
            );
            recorder.describe_counter(
                names.consumed.clone().into(),
                Some(Unit::Count),
                "Number of messages received.".into(),
            );
            recorder.describe_histogram(
                names.end_to_end_latency.clone().into(),
                Some(Unit::Milliseconds),
                "Latency between message produced and received.".into(),
            );
        });
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn count_produced(&self, topic: &str) {
        self.counter(&self.names.produced, self.labels(topic))
            .increment(1);
    }

    pub fn count_producer_error(&self, topic: &str, error: &str) {
        let mut labels = self.labels(topic);
        labels.push(Label::new("error", error.to_string()));
        self.counter(&self.names.produce_errors, labels).increment(1);
    }

    pub fn observe_producer_latency(&self, topic: &str, latency: Duration) {
        self.histogram(&self.names.produced_latency, self.labels(topic))
            .record(millis(latency));
    }

    pub fn count_consumed(&self, topic: &str) {
        self.counter(&self.names.consumed, self.labels(topic))
            .increment(1);
    }

    pub fn observe_end_to_end_latency(&self, topic: &str, latency: Duration) {
        self.histogram(&self.names.end_to_end_latency, self.labels(topic))
            .record(millis(latency));
    }

    fn labels(&self, topic: &str) -> Vec<Label> {
        vec![
            Label::new("cluster", self.cluster.clone()),
            Label::new("topic", topic.to_string()),
        ]
    }

    fn counter(&self, name: &str, labels: Vec<Label>) -> Counter {
        let key = Key::from_parts(name.to_string(), labels);
        self.with_recorder(|recorder| recorder.register_counter(&key, &metadata()))
    }

    fn histogram(&self, name: &str, labels: Vec<Label>) -> Histogram {
        let key = Key::from_parts(name.to_string(), labels);
        self.with_recorder(|recorder| recorder.register_histogram(&key, &metadata()))
    }

    fn with_recorder<T>(&self, f: impl FnOnce(&dyn Recorder) -> T) -> T {
        match &self.sink {
            Sink::Global => metrics::with_recorder(f),
            Sink::Recorder(recorder) => f(recorder.as_ref()),
        }
    }
}

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
