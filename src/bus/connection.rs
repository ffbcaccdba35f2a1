//! Broker connection lifecycle.
//!
//! The connection manager wires the transport observers, performs the initial
//! connect under a [`ConnectPolicy`] and runs the shutdown watcher, which is
//! the only way the bus is torn down.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::dispatch::Dispatcher;
use super::{BusError, Result};
use crate::transport::{ConnectCallback, ConnectionObservers, Transport, TransportError};

/// What to do when the initial broker connection fails.
#[derive(Clone, Default)]
pub enum ConnectPolicy {
    /// Log and exit the process with status 1.
    #[default]
    Terminate,
    /// Retry with backoff; return the last error once the backoff is exhausted.
    Retry(ExponentialBuilder),
    /// Return the error to the caller at once.
    Propagate,
}

impl fmt::Debug for ConnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminate => f.write_str("Terminate"),
            Self::Retry(_) => f.write_str("Retry"),
            Self::Propagate => f.write_str("Propagate"),
        }
    }
}

/// Owns the transport's connection state.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    client_id: String,
    quiesce: Duration,
    closed: CancellationToken,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, client_id: impl Into<String>, quiesce: Duration) -> Self {
        Self {
            transport,
            client_id: client_id.into(),
            quiesce,
            closed: CancellationToken::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Attach `on_connect` and a connection-lost logger to the transport.
    pub async fn attach(&self, on_connect: ConnectCallback) {
        let client_id = self.client_id.clone();
        let on_connection_lost = Arc::new(move |e: &TransportError| {
            error!(client_id = %client_id, error = %e, "Broker connection lost");
        });
        self.transport
            .set_observers(ConnectionObservers {
                on_connect,
                on_connection_lost,
            })
            .await;
    }

    /// Perform the initial connect under `policy`.
    pub async fn connect(&self, policy: &ConnectPolicy) -> Result<()> {
        match policy {
            ConnectPolicy::Propagate => self.try_connect().await,
            ConnectPolicy::Retry(backoff) => self.connect_with_retry(backoff).await,
            ConnectPolicy::Terminate => {
                if let Err(e) = self.try_connect().await {
                    error!(
                        client_id = %self.client_id,
                        error = %e,
                        "Cannot start without a broker connection, exiting"
                    );
                    std::process::exit(1);
                }
                Ok(())
            }
        }
    }

    async fn connect_with_retry(&self, backoff: &ExponentialBuilder) -> Result<()> {
        let mut delays = backoff.build();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let e = match self.try_connect().await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            let Some(delay) = delays.next() else {
                error!(
                    client_id = %self.client_id,
                    attempts = attempt,
                    error = %e,
                    "Giving up connecting to broker"
                );
                return Err(e);
            };
            warn!(
                client_id = %self.client_id,
                attempt,
                error = %e,
                retry_in_ms = %delay.as_millis(),
                "Broker connect failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn try_connect(&self) -> Result<()> {
        self.transport.connect().await.map_err(BusError::Connect)?;
        info!(client_id = %self.client_id, "Connected to broker");
        Ok(())
    }

    /// Spawn the watcher that tears the bus down once `signal` resolves.
    ///
    /// Teardown disconnects with the quiesce period, then drains the
    /// dispatcher. [`closed`](Self::closed) resolves when both are done.
    pub fn spawn_shutdown_watcher(
        &self,
        signal: BoxFuture<'static, ()>,
        dispatcher: Arc<Dispatcher>,
    ) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let client_id = self.client_id.clone();
        let quiesce = self.quiesce;
        let closed = self.closed.clone();

        tokio::spawn(async move {
            signal.await;
            info!(client_id = %client_id, "Shutdown signal received, disconnecting");

            if let Err(e) = transport.disconnect(quiesce).await {
                warn!(client_id = %client_id, error = %e, "Disconnect failed");
            }

            let stragglers = dispatcher.drain().await;
            info!(client_id = %client_id, stragglers, "Event bus closed");
            closed.cancel();
        })
    }

    /// Resolves once the shutdown watcher has finished.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
