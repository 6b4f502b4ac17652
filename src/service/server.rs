//! # Server
//!
//! Binds one listener per enabled transport, wraps every accepted link in a
//! [`Connection`] and keeps the set of live connections.
//!
//! The connection set is only touched by the accept side (insert after a successful
//! setup) and by each connection's watcher (remove once it is closed); callers see it
//! through [`Server::connections`] and [`ConnectionEvent`]s.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::core::schema::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::{
    Connection, ConnectionContext, ConnectionId, ConnectionOptions, Side,
};
use crate::protocol::registry::TypeRegistry;
use crate::service::events::{ConnectionEvent, EVENT_CAPACITY};
use crate::transport::tcp::TcpLinkListener;
use crate::transport::udp::UdpLinkListener;
use crate::transport::{Link, Listener, TransportKind};
use crate::utils::metrics::Metrics;

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

struct ServerInner {
    ctx: ConnectionContext,
    options: ConnectionOptions,
    max_connections: usize,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    /// Accepted links still running their setup
    in_setup: AtomicUsize,
    events: broadcast::Sender<ConnectionEvent>,
    cancel: CancellationToken,
}

impl ServerInner {
    fn connection_count(&self) -> usize {
        self.connections.read().map(|c| c.len()).unwrap_or(0)
    }

    fn insert(&self, conn: &Connection) {
        if let Ok(mut connections) = self.connections.write() {
            connections.insert(conn.id(), conn.clone());
        }
    }

    fn remove(&self, id: ConnectionId) {
        if let Ok(mut connections) = self.connections.write() {
            connections.remove(&id);
        }
    }

    /// Claim a slot for one more connection, counting setups still in progress.
    fn reserve(self: &Arc<Self>) -> Option<SetupSlot> {
        self.in_setup
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |in_setup| {
                (self.connection_count() + in_setup < self.max_connections)
                    .then_some(in_setup + 1)
            })
            .ok()
            .map(|_| SetupSlot(Arc::clone(self)))
    }
}

/// Held while an accepted link is set up; released once it is live or has failed.
struct SetupSlot(Arc<ServerInner>);

impl Drop for SetupSlot {
    fn drop(&mut self) {
        self.0.in_setup.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Server {
    inner: Arc<ServerInner>,
    local_addrs: Vec<(TransportKind, String)>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl Server {
    /// Bind every enabled transport and start accepting.
    #[instrument(skip(config))]
    pub async fn bind(config: NetworkConfig) -> Result<Server> {
        config.validate_strict()?;
        let max_payload = config.transport.max_payload_size;
        let server = &config.server;

        let mut listeners = Vec::new();
        if server.transports.tcp {
            listeners.push(Listener::Tcp(
                TcpLinkListener::bind(&server.address, max_payload).await?,
            ));
        }
        if server.transports.udp {
            listeners.push(Listener::Udp(
                UdpLinkListener::bind(&server.udp_address, max_payload).await?,
            ));
        }
        #[cfg(feature = "bluetooth")]
        if server.transports.bluetooth {
            listeners.push(Listener::Bluetooth(
                crate::transport::bluetooth::RfcommLinkListener::bind(
                    &server.bluetooth_address,
                    server.bluetooth_channel,
                    max_payload,
                )
                .await?,
            ));
        }
        if listeners.is_empty() {
            return Err(ProtocolError::ConfigError("no transport enabled".into()));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(ServerInner {
            ctx: ConnectionContext::default(),
            options: ConnectionOptions::server(&config),
            max_connections: server.max_connections,
            connections: RwLock::new(HashMap::new()),
            in_setup: AtomicUsize::new(0),
            events,
            cancel: CancellationToken::new(),
        });

        let local_addrs = listeners
            .iter()
            .map(|l| (l.kind(), l.local_addr()))
            .collect();
        let accept_tasks = listeners
            .into_iter()
            .map(|listener| tokio::spawn(accept_loop(Arc::clone(&inner), listener)))
            .collect();

        Ok(Server {
            inner,
            local_addrs,
            accept_tasks: Mutex::new(accept_tasks),
            shutdown_timeout: server.shutdown_timeout,
        })
    }

    /// Lifecycle events from now on. Events raised before subscribing are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Address actually bound for `kind` (useful with port 0).
    pub fn local_addr(&self, kind: TransportKind) -> Option<String> {
        self.local_addrs
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, addr)| addr.clone())
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .connections
            .read()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.inner
            .connections
            .read()
            .ok()
            .and_then(|c| c.get(&id).cloned())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connection_count()
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.inner.ctx.registry
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.ctx.metrics)
    }

    /// Handle plain packets of type `T` on every connection.
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

    /// Answer requests of type `Req` on every connection.
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

    /// Send `packet` to every live connection. Returns how many sends succeeded.
    pub async fn broadcast<T: Packet>(&self, packet: &T) -> usize {
        self.broadcast_where(packet, |_| true).await
    }

    /// Send `packet` to every live connection accepted by `filter`.
    pub async fn broadcast_where<T, F>(&self, packet: &T, filter: F) -> usize
    where
        T: Packet,
        F: Fn(&Connection) -> bool,
    {
        let targets: Vec<Connection> = self
            .connections()
            .into_iter()
            .filter(|c| c.is_alive() && filter(c))
            .collect();

        let sends = targets.iter().map(|conn| async move {
            match conn.send(packet).await {
                Ok(()) => true,
                Err(e) => {
                    debug!(id = conn.id(), error = %e, "Broadcast send failed");
                    false
                }
            }
        });
        join_all(sends).await.into_iter().filter(|sent| *sent).count()
    }

    /// Stop accepting, close every connection and wait for their `Lost` events.
    pub async fn shutdown(&self) {
        info!("Shutting down server");
        self.inner.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self
            .accept_tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            let _ = task.await;
        }

        join_all(self.connections().iter().map(Connection::close)).await;

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        while self.inner.connection_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    connections = self.inner.connection_count(),
                    "Shutdown timeout reached with connections still open"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.inner.ctx.metrics.log_metrics();
    }

    /// Serve until CTRL+C, then shut down.
    pub async fn run_until_ctrl_c(&self) -> Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("Received CTRL+C signal, shutting down");
        self.shutdown().await;
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

async fn accept_loop(inner: Arc<ServerInner>, mut listener: Listener) {
    let kind = listener.kind();
    loop {
        let accepted = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let link = match accepted {
            Ok(link) => link,
            Err(ProtocolError::ConnectionClosed) => break,
            Err(e) => {
                error!(transport = %kind, error = %e, "Error accepting connection");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        let Some(slot) = inner.reserve() else {
            warn!(
                remote = %link.remote,
                limit = inner.max_connections,
                "Connection limit reached, refusing"
            );
            continue;
        };
        tokio::spawn(serve(Arc::clone(&inner), link, slot));
    }
    debug!(transport = %kind, "Accept loop stopped");
}

/// Set up one accepted link and watch it until it closes.
async fn serve(inner: Arc<ServerInner>, link: Link, slot: SetupSlot) {
    let remote = link.remote.clone();
    let conn = match Connection::establish(
        link,
        Side::Acceptor,
        inner.ctx.clone(),
        inner.options.clone(),
    )
    .await
    {
        Ok(conn) => conn,
        Err(e) => {
            warn!(%remote, error = %e, "Connection setup failed");
            return;
        }
    };

    inner.insert(&conn);
    drop(slot);
    let _ = inner.events.send(ConnectionEvent::Established(conn.clone()));

    let reason = tokio::select! {
        reason = conn.closed() => reason,
        _ = inner.cancel.cancelled() => {
            conn.close().await;
            conn.closed().await
        }
    };
    inner.remove(conn.id());
    let _ = inner.events.send(ConnectionEvent::lost(&conn, reason));
}
