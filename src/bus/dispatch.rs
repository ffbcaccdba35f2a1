//! Inbound message dispatch.
//!
//! For every message on a subscribed topic the dispatcher decodes the payload
//! into a fresh event, records consumer metrics and hands the event to the
//! subscription's handler on a tracked task. Intake never waits on a handler:
//! tasks are spawned immediately and queue on a semaphore that bounds how many
//! handlers run at once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};

use super::{EventHandler, HandlerError, MetricsCollector};
use crate::config::DispatchConfig;
use crate::event::{Event, EventDecoder, EventType};
use crate::transport::InboundMessage;

/// What happened to a handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Handler succeeded.
    Handled,
    /// Handler reported an expected business condition; not logged.
    DomainError,
    /// Handler failed; logged as an operational error.
    Failed,
}

impl HandlerOutcome {
    /// Classify a handler result, logging non-domain failures.
    pub fn classify(
        result: &Result<(), HandlerError>,
        event_type: &EventType,
        topic: &str,
    ) -> Self {
        match result {
            Ok(()) => Self::Handled,
            Err(e) if e.is_domain() => Self::DomainError,
            Err(e) => {
                error!(
                    event_type = %event_type,
                    topic = %topic,
                    error = %e,
                    "Event handler failed"
                );
                Self::Failed
            }
        }
    }
}

/// Everything needed to dispatch messages for one subscription.
#[derive(Clone)]
pub struct DispatchTarget {
    pub event_type: EventType,
    /// Subscribed topic filter; used as the metrics topic label.
    pub topic: String,
    pub decoder: EventDecoder,
    pub handler: Arc<dyn EventHandler>,
}

/// Decodes inbound messages and runs handlers on a bounded set of tasks.
pub struct Dispatcher {
    metrics: MetricsCollector,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    drain_timeout: Duration,
    drop_expired: bool,
}

impl Dispatcher {
    pub fn new(metrics: MetricsCollector, config: &DispatchConfig) -> Self {
        Self {
            metrics,
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_handlers.max(1))),
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
            drop_expired: config.drop_expired,
        }
    }

    /// Handle one inbound message.
    ///
    /// Returns `false` if the message was dropped before reaching the handler.
    /// Messages arriving once a drain has started are dropped.
    pub fn dispatch(&self, target: &DispatchTarget, message: InboundMessage) -> bool {
        if self.tracker.is_closed() {
            debug!(
                event_type = %target.event_type,
                topic = %message.topic,
                "Dispatcher draining, dropping message"
            );
            return false;
        }

        let event: Arc<dyn Event> = match (target.decoder)(&message.payload) {
            Ok(event) => Arc::from(event),
            Err(e) => {
                error!(
                    event_type = %target.event_type,
                    topic = %message.topic,
                    error = %e,
                    "Failed to decode event, dropping message"
                );
                return false;
            }
        };

        match event.header().age() {
            Some(latency) => {
                self.metrics
                    .observe_end_to_end_latency(&target.topic, latency);
                trace!(
                    event_type = %target.event_type,
                    latency_ms = %latency.as_millis(),
                    "Event received"
                );
            }
            None => debug!(
                event_type = %target.event_type,
                "Event without created_at, skipping latency"
            ),
        }
        self.metrics.count_consumed(&target.topic);

        if self.drop_expired && event.expired() {
            debug!(
                event_type = %target.event_type,
                topic = %message.topic,
                "Dropping expired event"
            );
            return false;
        }

        let permits = self.permits.clone();
        let handler = target.handler.clone();
        let event_type = target.event_type.clone();
        let topic = message.topic;
        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let result = handler.handle(event).await;
            HandlerOutcome::classify(&result, &event_type, &topic);
        });

        true
    }

    /// Handler invocations spawned but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Refuse further dispatches and wait for spawned handlers.
    ///
    /// Returns the number of invocations still running when the drain timeout
    /// elapsed; those are left to finish or die with the process.
    pub async fn drain(&self) -> usize {
        self.tracker.close();
        if tokio::time::timeout(self.drain_timeout, self.tracker.wait())
            .await
            .is_ok()
        {
            debug!("All event handlers finished");
            return 0;
        }

        let stragglers = self.tracker.len();
        warn!(
            stragglers,
            timeout_ms = %self.drain_timeout.as_millis(),
            "Event handlers still running after drain timeout"
        );
        stragglers
    }
}
