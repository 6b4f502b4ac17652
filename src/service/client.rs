//! # Client
//!
//! Opens one connection to the configured endpoint and keeps it open.
//!
//! A supervisor task owns the reconnect policy as a small state machine:
//!
//! ```text
//! Idle → Connecting → Connected ⇄ Reconnecting
//!                         ↓            ↓
//!                      Stopped ←───────┘   (close(), auto-reconnect off, attempts exhausted)
//! ```
//!
//! Every reconnect builds a brand-new [`Connection`], so the key exchange and type
//! negotiation are replayed from scratch. Application code keeps using the [`Client`]
//! and never holds on to the replaced connection.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::NetworkConfig;
use crate::core::schema::Packet;
use crate::error::{LostReason, ProtocolError, Result};
use crate::protocol::connection::{Connection, ConnectionContext, ConnectionOptions, Side};
use crate::protocol::registry::TypeRegistry;
use crate::service::backoff::Backoff;
use crate::service::events::{ConnectionEvent, EVENT_CAPACITY};
use crate::transport::{self, Endpoint};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

#[derive(Debug, Clone)]
struct ReconnectPolicy {
    enabled: bool,
    /// 0 means unlimited
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

struct ClientInner {
    endpoint: Endpoint,
    max_payload: usize,
    connect_timeout: Duration,
    policy: ReconnectPolicy,
    ctx: ConnectionContext,
    options: ConnectionOptions,
    current: watch::Sender<Option<Connection>>,
    state: watch::Sender<ClientState>,
    events: broadcast::Sender<ConnectionEvent>,
    cancel: CancellationToken,
}

impl ClientInner {
    async fn open(&self) -> Result<Connection> {
        let link =
            transport::open(&self.endpoint, self.max_payload, self.connect_timeout).await?;
        Connection::establish(link, Side::Initiator, self.ctx.clone(), self.options.clone()).await
    }

    fn connected(&self, conn: &Connection) {
        self.current.send_replace(Some(conn.clone()));
        self.state.send_replace(ClientState::Connected);
        let _ = self.events.send(ConnectionEvent::Established(conn.clone()));
    }

    fn lost(&self, conn: &Connection, reason: LostReason) {
        self.current.send_replace(None);
        let _ = self.events.send(ConnectionEvent::lost(conn, reason));
    }

    /// Retry with backoff until connected, cancelled or out of attempts.
    async fn reconnect(&self) -> Option<Connection> {
        let mut backoff = Backoff::new(self.policy.initial_delay, self.policy.max_delay);
        loop {
            if self.policy.max_attempts != 0 && backoff.failures() >= self.policy.max_attempts {
                warn!(attempts = backoff.failures(), "Giving up reconnecting");
                return None;
            }
            let delay = backoff.next_delay();
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            self.ctx.metrics.reconnect_attempt();
            match self.open().await {
                Ok(conn) if self.cancel.is_cancelled() => {
                    conn.close().await;
                    return None;
                }
                Ok(conn) => {
                    info!(attempt = backoff.failures(), id = conn.id(), "Reconnected");
                    return Some(conn);
                }
                Err(e) => {
                    warn!(attempt = backoff.failures(), error = %e, "Reconnect attempt failed")
                }
            }
        }
    }
}

async fn supervise(inner: Arc<ClientInner>, mut conn: Connection) {
    loop {
        let reason = tokio::select! {
            reason = conn.closed() => reason,
            _ = inner.cancel.cancelled() => {
                conn.close().await;
                let reason = conn.closed().await;
                inner.lost(&conn, reason);
                break;
            }
        };
        inner.lost(&conn, reason);

        if !inner.policy.enabled {
            break;
        }
        inner.state.send_replace(ClientState::Reconnecting);
        match inner.reconnect().await {
            Some(next) => {
                inner.connected(&next);
                conn = next;
            }
            None => break,
        }
    }
    inner.state.send_replace(ClientState::Stopped);
}

pub struct Client {
    inner: Arc<ClientInner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Build a client without connecting, so handlers and subscriptions can be set up
    /// before the first `Established` event.
    pub fn new(config: NetworkConfig) -> Result<Client> {
        config.validate_strict()?;
        let client = &config.client;
        let (current, _) = watch::channel(None);
        let (state, _) = watch::channel(ClientState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = ClientInner {
            endpoint: Endpoint {
                kind: client.transport,
                address: client.address.clone(),
                channel: client.bluetooth_channel,
            },
            max_payload: config.transport.max_payload_size,
            connect_timeout: client.connection_timeout,
            policy: ReconnectPolicy {
                enabled: client.auto_reconnect,
                max_attempts: client.max_reconnect_attempts,
                initial_delay: client.reconnect_delay,
                max_delay: client.max_reconnect_delay,
            },
            ctx: ConnectionContext::default(),
            options: ConnectionOptions::client(&config),
            current,
            state,
            events,
            cancel: CancellationToken::new(),
        };
        Ok(Client {
            inner: Arc::new(inner),
            supervisor: Mutex::new(None),
        })
    }

    /// Build and start in one step.
    pub async fn connect(config: NetworkConfig) -> Result<Client> {
        let client = Client::new(config)?;
        client.start().await?;
        Ok(client)
    }

    /// Open the first connection and start supervising it.
    ///
    /// A failed first attempt is returned to the caller and leaves the client `Idle`.
    #[instrument(skip(self), fields(endpoint = %self.inner.endpoint.address))]
    pub async fn start(&self) -> Result<()> {
        if self.state() != ClientState::Idle {
            return Err(ProtocolError::ConfigError("client already started".into()));
        }
        self.inner.state.send_replace(ClientState::Connecting);

        let conn = match self.inner.open().await {
            Ok(conn) => conn,
            Err(e) => {
                self.inner.state.send_replace(ClientState::Idle);
                return Err(e);
            }
        };
        self.inner.connected(&conn);

        let handle = tokio::spawn(supervise(Arc::clone(&self.inner), conn));
        if let Ok(mut slot) = self.supervisor.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Lifecycle events from now on, for every connection this client opens.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// The connection currently in use, if any.
    pub fn current(&self) -> Option<Connection> {
        self.inner.current.borrow().clone()
    }

    /// Wait until a live connection is available.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<Connection> {
        let mut rx = self.inner.current.subscribe();
        with_timeout_error(
            async move {
                let current = rx
                    .wait_for(|c| c.as_ref().is_some_and(Connection::is_alive))
                    .await
                    .map_err(|_| ProtocolError::ConnectionClosed)?;
                current.clone().ok_or(ProtocolError::ConnectionClosed)
            },
            timeout,
        )
        .await
    }

    fn live(&self) -> Result<Connection> {
        self.current()
            .filter(Connection::is_alive)
            .ok_or(ProtocolError::ConnectionClosed)
    }

    pub async fn send<T: Packet>(&self, packet: &T) -> Result<()> {
        self.live()?.send(packet).await
    }

    pub async fn send_request<Req: Packet, Resp: Packet>(&self, request: &Req) -> Result<Resp> {
        self.live()?.send_request(request).await
    }

    pub async fn send_request_timeout<Req: Packet, Resp: Packet>(
        &self,
        request: &Req,
        deadline: Duration,
    ) -> Result<Resp> {
        self.live()?.send_request_timeout(request, deadline).await
    }

    /// Handle plain packets of type `T`, across reconnects.
    pub fn on<T, F>(&self, handler: F) -> Result<()>
    where
        T: Packet,
        F: Fn(T, &Connection) + Send + Sync + 'static,
    {
        self.inner
            .ctx
            .handlers
            .on::<T, F>(&self.inner.ctx.registry, handler)
    }

    /// Answer requests of type `Req`, across reconnects.
    pub fn on_request<Req, Resp, F>(&self, handler: F) -> Result<()>
    where
        Req: Packet,
        Resp: Packet,
        F: Fn(Req, &Connection) -> Result<Resp> + Send + Sync + 'static,
    {
        self.inner
            .ctx
            .handlers
            .on_request::<Req, Resp, F>(&self.inner.ctx.registry, handler)
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.inner.ctx.registry
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.ctx.metrics)
    }

    /// Stop reconnecting and close the current connection gracefully.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let supervisor = self.supervisor.lock().ok().and_then(|mut s| s.take());
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
        self.inner.state.send_replace(ClientState::Stopped);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}
