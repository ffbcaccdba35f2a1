//! MQTT transport implementation over rumqttc.
//!
//! rumqttc drives the connection from an `EventLoop` that has to be polled
//! continuously. One background task per connection polls it, routes inbound
//! PUBLISH packets to the registered filters, resolves acknowledgement waiters
//! and keeps reconnecting after errors.
//!
//! rumqttc does not hand out packet ids when a request is queued, so waiters
//! are queued in request order and bound to a packet id when the matching
//! `Outgoing` event is observed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish,
    QoS, SubAck, SubscribeReasonCode,
};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    topic_matches, ConnectionObservers, InboundMessage, MessageCallback, Qos, Result, Transport,
    TransportError,
};
use crate::config::MqttConfig;

/// First reconnect delay; doubles up to `max_reconnect_interval`.
const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Lower bound accepted by the client for the keep-alive interval.
const MIN_KEEP_ALIVE_SECS: u64 = 5;

type AckSender = oneshot::Sender<Result<()>>;

/// Acknowledgement waiters for in-flight subscribe and publish requests.
#[derive(Default)]
struct AckTracker {
    queued_subscribes: VecDeque<AckSender>,
    queued_publishes: VecDeque<(Qos, AckSender)>,
    subscribes: HashMap<u16, AckSender>,
    publishes: HashMap<u16, AckSender>,
}

impl AckTracker {
    fn bind_subscribe(&mut self, pkid: u16) {
        if let Some(waiter) = self.queued_subscribes.pop_front() {
            self.subscribes.insert(pkid, waiter);
        }
    }

    fn bind_publish(&mut self, pkid: u16) {
        match self.queued_publishes.pop_front() {
            // QoS 0 has no acknowledgement; the write itself completes it.
            Some((Qos::AtMostOnce, waiter)) => {
                let _ = waiter.send(Ok(()));
            }
            Some((_, waiter)) => {
                self.publishes.insert(pkid, waiter);
            }
            None => {}
        }
    }

    fn resolve_subscribe(&mut self, ack: &SubAck) {
        let Some(waiter) = self.subscribes.remove(&ack.pkid) else {
            return;
        };
        let refused = ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure));
        let outcome = if refused {
            Err(TransportError::Rejected(format!(
                "subscription refused (pkid {})",
                ack.pkid
            )))
        } else {
            Ok(())
        };
        let _ = waiter.send(outcome);
    }

    fn resolve_publish(&mut self, pkid: u16) {
        if let Some(waiter) = self.publishes.remove(&pkid) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Fail every waiter, bound or still queued.
    ///
    /// Sessions are clean, so requests rumqttc had not written yet are
    /// dropped on the next CONNACK and never produce an `Outgoing` event.
    /// A request racing the failure may still be written; waiters can then
    /// only run ahead of the requests, never behind them.
    fn fail_all(&mut self, error: &TransportError) {
        for (_, waiter) in self.subscribes.drain().chain(self.publishes.drain()) {
            let _ = waiter.send(Err(error.clone()));
        }
        for waiter in self.queued_subscribes.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        for (_, waiter) in self.queued_publishes.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

/// State shared between the transport handle and its event loop task.
#[derive(Default)]
struct Shared {
    observers: RwLock<ConnectionObservers>,
    routes: RwLock<Vec<(String, MessageCallback)>>,
    acks: Mutex<AckTracker>,
    shutdown: CancellationToken,
}

impl Shared {
    fn acks(&self) -> MutexGuard<'_, AckTracker> {
        self.acks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install `callback` for `filter`, returning the callback it replaced.
    async fn insert_route(&self, filter: &str, callback: MessageCallback) -> Option<MessageCallback> {
        let mut routes = self.routes.write().await;
        match routes.iter_mut().find(|(f, _)| f == filter) {
            Some(route) => Some(std::mem::replace(&mut route.1, callback)),
            None => {
                routes.push((filter.to_string(), callback));
                None
            }
        }
    }

    async fn restore_route(&self, filter: &str, previous: Option<MessageCallback>) {
        let mut routes = self.routes.write().await;
        match previous {
            Some(callback) => {
                if let Some(route) = routes.iter_mut().find(|(f, _)| f == filter) {
                    route.1 = callback;
                }
            }
            None => routes.retain(|(f, _)| f != filter),
        }
    }

    async fn route(&self, publish: Publish) {
        let message = InboundMessage {
            qos: from_mqtt_qos(publish.qos),
            retained: publish.retain,
            topic: publish.topic,
            payload: publish.payload,
        };

        let callbacks: Vec<MessageCallback> = self
            .routes
            .read()
            .await
            .iter()
            .filter(|(filter, _)| topic_matches(filter, &message.topic))
            .map(|(_, callback)| callback.clone())
            .collect();

        if callbacks.is_empty() {
            debug!(topic = %message.topic, "No route for inbound message");
            return;
        }

        for callback in callbacks {
            callback(message.clone());
        }
    }
}

struct Connection {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

/// MQTT transport using rumqttc.
///
/// Sessions are clean: the broker keeps no state across reconnects, so
/// subscriptions are replayed by the on-connect observer.
pub struct MqttTransport {
    config: MqttConfig,
    client_id: String,
    shared: Arc<Shared>,
    connection: RwLock<Option<Connection>>,
    /// Keeps waiter queues in the same order as the requests they track.
    request_order: tokio::sync::Mutex<()>,
}

impl MqttTransport {
    pub fn new(config: MqttConfig, client_id: impl Into<String>) -> Self {
        Self {
            config,
            client_id: client_id.into(),
            shared: Arc::new(Shared::default()),
            connection: RwLock::new(None),
            request_order: tokio::sync::Mutex::new(()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn options(&self, host: &str, port: u16) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), host, port);
        options
            .set_keep_alive(Duration::from_secs(self.config.ping_timeout.max(MIN_KEEP_ALIVE_SECS)))
            .set_clean_session(true);
        if !self.config.user.is_empty() {
            options.set_credentials(self.config.user.clone(), self.config.password.clone());
        }
        options
    }

    async fn client(&self) -> Result<AsyncClient> {
        self.connection
            .read()
            .await
            .as_ref()
            .map(|connection| connection.client.clone())
            .ok_or(TransportError::NotConnected)
    }

    async fn await_ack(&self, waiter: oneshot::Receiver<Result<()>>) -> Result<()> {
        let timeout = Duration::from_secs(self.config.operation_timeout);
        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::ConnectionLost(
                "acknowledgement waiter dropped".to_string(),
            )),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn connect_broker(&self, broker: &str) -> Result<()> {
        let (host, port) = parse_broker(broker)?;
        let (client, eventloop) =
            AsyncClient::new(self.options(host, port), self.config.message_channel_depth);

        let (connected_tx, connected_rx) = oneshot::channel();
        let event_loop = tokio::spawn(run_event_loop(
            eventloop,
            self.shared.clone(),
            connected_tx,
            Duration::from_secs(self.config.max_reconnect_interval),
        ));

        // Installed before the first CONNACK so on-connect observers can already use it.
        *self.connection.write().await = Some(Connection { client, event_loop });

        let timeout = Duration::from_secs(self.config.connect_timeout);
        let outcome = match tokio::time::timeout(timeout, connected_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::Connect(
                "event loop stopped before connecting".to_string(),
            )),
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        if outcome.is_err() {
            if let Some(connection) = self.connection.write().await.take() {
                connection.event_loop.abort();
            }
        }
        outcome
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn set_observers(&self, observers: ConnectionObservers) {
        *self.shared.observers.write().await = observers;
    }

    async fn connect(&self) -> Result<()> {
        let mut last_error = TransportError::Connect("no brokers configured".to_string());

        for broker in &self.config.brokers {
            match self.connect_broker(broker).await {
                Ok(()) => {
                    info!(
                        broker = %broker,
                        client_id = %self.client_id,
                        "MQTT connection established"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(broker = %broker, error = %e, "Broker connect attempt failed");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn disconnect(&self, quiesce: Duration) -> Result<()> {
        self.shared.shutdown.cancel();

        let Some(mut connection) = self.connection.write().await.take() else {
            return Ok(());
        };

        let result = connection
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Client(e.to_string()));

        if tokio::time::timeout(quiesce, &mut connection.event_loop)
            .await
            .is_err()
        {
            debug!(quiesce_ms = %quiesce.as_millis(), "Event loop still running after quiesce, aborting");
            connection.event_loop.abort();
        }

        self.shared.acks().fail_all(&TransportError::NotConnected);
        result
    }

    async fn subscribe(&self, topic: &str, qos: Qos, callback: MessageCallback) -> Result<()> {
        let client = self.client().await?;

        // Route first so retained messages sent right after the SUBACK are not lost.
        let previous = self.shared.insert_route(topic, callback).await;

        let waiter = {
            let _order = self.request_order.lock().await;
            let (tx, rx) = oneshot::channel();
            self.shared.acks().queued_subscribes.push_back(tx);
            if let Err(e) = client.subscribe(topic, to_mqtt_qos(qos)).await {
                self.shared.acks().queued_subscribes.pop_back();
                self.shared.restore_route(topic, previous).await;
                return Err(TransportError::Client(e.to_string()));
            }
            rx
        };

        let outcome = self.await_ack(waiter).await;
        if outcome.is_err() {
            self.shared.restore_route(topic, previous).await;
        }
        outcome
    }

    async fn publish(
        &self,
        topic: &str,
        qos: Qos,
        retained: bool,
        payload: Vec<u8>,
    ) -> Result<()> {
        let client = self.client().await?;

        let waiter = {
            let _order = self.request_order.lock().await;
            let (tx, rx) = oneshot::channel();
            self.shared.acks().queued_publishes.push_back((qos, tx));
            if let Err(e) = client
                .publish(topic, to_mqtt_qos(qos), retained, payload)
                .await
            {
                self.shared.acks().queued_publishes.pop_back();
                return Err(TransportError::Client(e.to_string()));
            }
            rx
        };

        self.await_ack(waiter).await
    }
}

/// Poll the rumqttc event loop until shutdown.
///
/// `connected` resolves with the outcome of the first connection attempt; if
/// that attempt fails the task exits so the caller can try the next broker.
async fn run_event_loop(
    mut eventloop: EventLoop,
    shared: Arc<Shared>,
    connected: oneshot::Sender<Result<()>>,
    max_reconnect_interval: Duration,
) {
    let mut connected = Some(connected);
    let mut delay = MIN_RECONNECT_DELAY;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    warn!(code = ?ack.code, "Broker refused connection");
                    continue;
                }
                delay = MIN_RECONNECT_DELAY;
                match connected.take() {
                    Some(tx) => {
                        let _ = tx.send(Ok(()));
                    }
                    None => info!("Reconnected to broker"),
                }
                let on_connect = shared.observers.read().await.on_connect.clone();
                on_connect();
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => shared.route(publish).await,
            Ok(Event::Incoming(Packet::SubAck(ack))) => shared.acks().resolve_subscribe(&ack),
            Ok(Event::Incoming(Packet::PubAck(ack))) => shared.acks().resolve_publish(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                shared.acks().resolve_publish(comp.pkid)
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => shared.acks().bind_subscribe(pkid),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => shared.acks().bind_publish(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) if shared.shutdown.is_cancelled() => {
                debug!("Disconnect sent, stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if shared.shutdown.is_cancelled() {
                    debug!(error = %e, "Event loop stopped during shutdown");
                    break;
                }

                if let Some(tx) = connected.take() {
                    let _ = tx.send(Err(TransportError::Connect(e.to_string())));
                    return;
                }

                let error = TransportError::ConnectionLost(e.to_string());
                shared.acks().fail_all(&error);
                let on_connection_lost = shared.observers.read().await.on_connection_lost.clone();
                on_connection_lost(&error);

                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = std::cmp::min(delay * 2, max_reconnect_interval);
            }
        }
    }
}

/// Split a `host:port` broker address.
fn parse_broker(broker: &str) -> Result<(&str, u16)> {
    let (host, port) = broker
        .rsplit_once(':')
        .ok_or_else(|| TransportError::Connect(format!("broker '{}' is not host:port", broker)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| TransportError::Connect(format!("broker '{}' has an invalid port", broker)))?;
    if host.is_empty() {
        return Err(TransportError::Connect(format!(
            "broker '{}' has an empty host",
            broker
        )));
    }
    Ok((host, port))
}

fn to_mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn from_mqtt_qos(qos: QoS) -> Qos {
    match qos {
        QoS::AtMostOnce => Qos::AtMostOnce,
        QoS::AtLeastOnce => Qos::AtLeastOnce,
        QoS::ExactlyOnce => Qos::ExactlyOnce,
    }
}
