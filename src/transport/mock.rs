//! Mock transport implementation for testing.
//!
//! Records every subscribe and publish call, lets tests inject failures,
//! push inbound messages and fire connection lifecycle events by hand.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{
    topic_matches, ConnectionObservers, InboundMessage, MessageCallback, Qos, Result, Transport,
    TransportError,
};

/// A subscribe request seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeCall {
    pub topic: String,
    pub qos: Qos,
}

/// A publish request seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub qos: Qos,
    pub retained: bool,
    pub payload: Vec<u8>,
}

/// Mock transport for testing.
#[derive(Default)]
pub struct MockTransport {
    observers: RwLock<ConnectionObservers>,
    routes: RwLock<Vec<(String, MessageCallback)>>,
    subscribe_calls: RwLock<Vec<SubscribeCall>>,
    published: RwLock<Vec<PublishedMessage>>,
    connected: RwLock<bool>,
    disconnects: RwLock<usize>,
    fail_on_connect: RwLock<bool>,
    fail_on_subscribe: RwLock<bool>,
    fail_on_publish: RwLock<bool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_connect(&self, fail: bool) {
        *self.fail_on_connect.write().await = fail;
    }

    pub async fn set_fail_on_subscribe(&self, fail: bool) {
        *self.fail_on_subscribe.write().await = fail;
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }

    pub async fn disconnect_count(&self) -> usize {
        *self.disconnects.read().await
    }

    pub async fn subscribe_calls(&self) -> Vec<SubscribeCall> {
        self.subscribe_calls.read().await.clone()
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.read().await.clone()
    }

    /// Topic filters with an active route.
    pub async fn routed_filters(&self) -> Vec<String> {
        self.routes
            .read()
            .await
            .iter()
            .map(|(filter, _)| filter.clone())
            .collect()
    }

    /// Deliver an inbound message to every matching route.
    ///
    /// Returns the number of callbacks invoked.
    pub async fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let message = InboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
            qos: Qos::AtMostOnce,
            retained: false,
        };

        let callbacks: Vec<MessageCallback> = self
            .routes
            .read()
            .await
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, callback)| callback.clone())
            .collect();

        for callback in &callbacks {
            callback(message.clone());
        }
        callbacks.len()
    }

    /// Fire the on-connect observer as the broker would after a reconnect.
    pub async fn simulate_reconnect(&self) {
        *self.connected.write().await = true;
        let on_connect = self.observers.read().await.on_connect.clone();
        on_connect();
    }

    /// Fire the connection-lost observer.
    pub async fn simulate_connection_lost(&self, reason: &str) {
        *self.connected.write().await = false;
        let on_lost = self.observers.read().await.on_connection_lost.clone();
        on_lost(&TransportError::ConnectionLost(reason.to_string()));
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn set_observers(&self, observers: ConnectionObservers) {
        *self.observers.write().await = observers;
    }

    async fn connect(&self) -> Result<()> {
        if *self.fail_on_connect.read().await {
            return Err(TransportError::Connect("Mock connect failure".to_string()));
        }
        *self.connected.write().await = true;
        let on_connect = self.observers.read().await.on_connect.clone();
        on_connect();
        Ok(())
    }

    async fn disconnect(&self, _quiesce: Duration) -> Result<()> {
        *self.connected.write().await = false;
        *self.disconnects.write().await += 1;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: Qos, callback: MessageCallback) -> Result<()> {
        let fail = *self.fail_on_subscribe.read().await;
        self.subscribe_calls.write().await.push(SubscribeCall {
            topic: topic.to_string(),
            qos,
        });

        if fail {
            return Err(TransportError::Rejected(format!(
                "Mock subscribe failure for {}",
                topic
            )));
        }

        let mut routes = self.routes.write().await;
        match routes.iter_mut().find(|(filter, _)| filter == topic) {
            Some(route) => route.1 = callback,
            None => routes.push((topic.to_string(), callback)),
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: Qos,
        retained: bool,
        payload: Vec<u8>,
    ) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(TransportError::Client("Mock publish failure".to_string()));
        }
        self.published.write().await.push(PublishedMessage {
            topic: topic.to_string(),
            qos,
            retained,
            payload,
        });
        Ok(())
    }
}
