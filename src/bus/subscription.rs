//! Subscription tracking and reconnect replay.
//!
//! Every successful subscribe is recorded under its (topic, event type) key.
//! The broker keeps a single subscription per topic filter, so recording a
//! new event type for a topic drops the previous record for that topic.
//! After each reconnect the whole map is replayed with the recorded
//! parameters.
//!
//! Broker requests and map updates happen under one lock, so a replay never
//! reinstalls a subscription that a concurrent subscribe has replaced.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{error, info};

use super::dispatch::{DispatchTarget, Dispatcher};
use super::{BusError, EventHandler, Result};
use crate::event::{EventRegistry, EventType};
use crate::transport::{MessageCallback, Qos, Transport};

/// Identity of a tracked subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub topic: String,
    pub event_type: EventType,
}

/// Parameters of a successful subscribe, replayed verbatim on reconnect.
#[derive(Clone)]
pub struct Subscription {
    pub event_type: EventType,
    pub topic: String,
    pub qos: Qos,
    pub handler: Arc<dyn EventHandler>,
}

impl Subscription {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            topic: self.topic.clone(),
            event_type: self.event_type.clone(),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event_type", &self.event_type)
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

/// Issues subscribe requests and remembers the ones that succeeded.
pub struct SubscriptionManager {
    transport: Arc<dyn Transport>,
    registry: Arc<EventRegistry>,
    dispatcher: Arc<Dispatcher>,
    subscriptions: RwLock<HashMap<SubscriptionKey, Subscription>>,
    /// Held across a broker request and the map update that follows it.
    apply_order: tokio::sync::Mutex<()>,
}

impl SubscriptionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<EventRegistry>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            transport,
            registry,
            dispatcher,
            subscriptions: RwLock::new(HashMap::new()),
            apply_order: tokio::sync::Mutex::new(()),
        }
    }

    /// Subscribe `handler` to `topic` and track it on success.
    ///
    /// Fails with `UnknownEventType` before touching the broker if the type
    /// is not registered. A rejected or timed out subscribe is logged and
    /// returned; nothing is tracked in either case.
    pub async fn subscribe(
        &self,
        event_type: EventType,
        topic: &str,
        qos: Qos,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        let subscription = Subscription {
            event_type,
            topic: topic.to_string(),
            qos,
            handler,
        };
        let _order = self.apply_order.lock().await;
        self.apply(&subscription).await?;

        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subscriptions.retain(|key, _| key.topic != subscription.topic);
        subscriptions.insert(subscription.key(), subscription);
        Ok(())
    }

    /// Re-issue every tracked subscription against the broker.
    ///
    /// Reads the map once the lock is held, so it replays what is tracked
    /// at that point. Failures are logged and left for the next reconnect.
    /// Returns the number of subscriptions re-established.
    pub async fn resubscribe_all(&self) -> usize {
        let _order = self.apply_order.lock().await;
        let current = self.subscriptions();
        if current.is_empty() {
            return 0;
        }

        let mut restored = 0;
        for subscription in &current {
            match self.apply(subscription).await {
                Ok(()) => restored += 1,
                Err(e) => error!(
                    topic = %subscription.topic,
                    event_type = %subscription.event_type,
                    error = %e,
                    "Re-subscribe after reconnect failed"
                ),
            }
        }

        info!(
            restored,
            total = current.len(),
            "Subscriptions replayed after connect"
        );
        restored
    }

    /// Snapshot of the tracked subscriptions, ordered by topic.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subscriptions: Vec<Subscription> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        subscriptions.sort_by(|a, b| a.key().cmp(&b.key()));
        subscriptions
    }

    async fn apply(&self, subscription: &Subscription) -> Result<()> {
        let decoder = self.registry.decoder(&subscription.event_type)?;
        let target = DispatchTarget {
            event_type: subscription.event_type.clone(),
            topic: subscription.topic.clone(),
            decoder,
            handler: subscription.handler.clone(),
        };
        let dispatcher = self.dispatcher.clone();
        let callback: MessageCallback = Arc::new(move |message| {
            dispatcher.dispatch(&target, message);
        });

        match self
            .transport
            .subscribe(&subscription.topic, subscription.qos, callback)
            .await
        {
            Ok(()) => {
                info!(
                    topic = %subscription.topic,
                    event_type = %subscription.event_type,
                    qos = %subscription.qos,
                    "Subscribed"
                );
                Ok(())
            }
            Err(source) => {
                error!(
                    topic = %subscription.topic,
                    event_type = %subscription.event_type,
                    error = %source,
                    "Subscribe failed"
                );
                Err(BusError::Subscribe {
                    topic: subscription.topic.clone(),
                    source,
                })
            }
        }
    }
}
