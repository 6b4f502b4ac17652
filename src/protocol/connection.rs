//! # Connection
//!
//! One peer relationship over one [`Link`]. A connection runs four tasks:
//!
//! - **reader**: reads frames, verifies/decrypts them, answers control packets inline and
//!   hands application packets on in arrival order
//! - **writer**: the only owner of the sink, fed by a bounded queue
//! - **dispatcher**: runs application handlers one at a time, in arrival order
//! - **heartbeat**: keeps an idle connection visibly alive
//!
//! Anything that compromises protocol state (security failure, undecodable stream,
//! socket loss, inactivity) closes the connection with a [`LostReason`], and every
//! pending request fails immediately with that reason.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{NetworkConfig, TransportConfig};
use crate::core::envelope::{Envelope, Role};
use crate::core::frame::Frame;
use crate::core::payload::{decode_value, encode_packet};
use crate::core::schema::Packet;
use crate::error::{constants, LostReason, ProtocolError, Result};
use crate::protocol::correlation::Correlator;
use crate::protocol::dispatcher::{Dispatcher, Handler};
use crate::protocol::message::{is_control, type_ids, ControlMessage};
use crate::protocol::registry::{PeerTypes, TypeEntry, TypeRegistry};
use crate::service::secure::{ChannelOptions, SecureChannel, SecureState};
use crate::transport::{close_quietly, udp, FrameSink, FrameStream, Link, TransportKind};
use crate::utils::metrics::Metrics;
use crate::utils::replay_cache::ReplayCache;
use crate::utils::timeout::{with_timeout_error, SHUTDOWN_TIMEOUT};

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Frames of not-yet-described types held before the connection gives up
const MAX_HELD_FRAMES: usize = 1024;

/// How long a graceful close keeps reading so the peer's last frames are not reset
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Which side starts the key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Initiator,
    Acceptor,
}

/// Per-connection settings, derived from [`NetworkConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub connection_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub write_queue: usize,
    pub channel: ChannelOptions,
    pub accept_unknown_types: bool,
}

fn channel_options(transport: &TransportConfig) -> ChannelOptions {
    ChannelOptions {
        secure: transport.encryption_enabled,
        sign_frames: transport.encryption_enabled && transport.sign_frames,
        compression: transport
            .compression_enabled
            .then_some((transport.compression_kind, transport.compression_threshold_bytes)),
        max_payload: transport.max_payload_size,
    }
}

impl ConnectionOptions {
    pub fn server(config: &NetworkConfig) -> Self {
        Self {
            connection_timeout: config.server.connection_timeout,
            heartbeat_interval: config.server.heartbeat_interval,
            request_timeout: config.server.request_timeout,
            shutdown_timeout: config.server.shutdown_timeout,
            write_queue: config.server.backpressure_limit,
            channel: channel_options(&config.transport),
            accept_unknown_types: config.transport.accept_unknown_types,
        }
    }

    pub fn client(config: &NetworkConfig) -> Self {
        Self {
            connection_timeout: config.client.connection_timeout,
            heartbeat_interval: config.client.heartbeat_interval,
            request_timeout: config.client.response_timeout,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
            write_queue: config.server.backpressure_limit,
            channel: channel_options(&config.transport),
            accept_unknown_types: config.transport.accept_unknown_types,
        }
    }
}

/// Container state shared by all of its connections.
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    pub registry: Arc<TypeRegistry>,
    pub handlers: Arc<Dispatcher>,
    pub metrics: Arc<Metrics>,
    pub replay_cache: Arc<Mutex<ReplayCache>>,
}

/// An application packet decoded against its agreed schema.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub entry: Arc<TypeEntry>,
    pub value: Value,
}

/// What a pending request can be resolved with.
#[derive(Debug)]
pub(crate) enum Reply {
    Control(ControlMessage),
    Packet(InboundPacket),
}

struct Inbound {
    role: Role,
    correlation_id: u64,
    packet: InboundPacket,
}

struct Inner {
    id: ConnectionId,
    kind: TransportKind,
    local: String,
    remote: String,
    options: ConnectionOptions,
    ctx: ConnectionContext,
    handlers: Dispatcher,
    peer_types: PeerTypes,
    correlator: Correlator<Reply>,
    secure: SecureChannel,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    closed: watch::Sender<Option<LostReason>>,
    aborted: AtomicBool,
    writer: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a live (or closed) connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("transport", &self.inner.kind)
            .field("remote", &self.inner.remote)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Connection {
    /// Start the connection tasks on `link` and run the key exchange if enabled.
    ///
    /// Returns only once the channel is usable; a failed handshake closes the
    /// connection and returns the error.
    #[instrument(skip_all, fields(transport = %link.kind, remote = %link.remote))]
    pub async fn establish(
        link: Link,
        side: Side,
        ctx: ConnectionContext,
        options: ConnectionOptions,
    ) -> Result<Connection> {
        let Link {
            kind,
            local,
            remote,
            stream,
            sink,
        } = link;

        let (outbound, queue) = mpsc::channel(options.write_queue.max(1));
        let (closed, _) = watch::channel(None);
        let secure = SecureChannel::new(options.channel);
        let conn = Connection {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                local,
                remote,
                options,
                ctx,
                handlers: Dispatcher::new(),
                peer_types: PeerTypes::new(),
                correlator: Correlator::new(),
                secure,
                outbound,
                cancel: CancellationToken::new(),
                closed,
                aborted: AtomicBool::new(false),
                writer: Mutex::new(None),
            }),
        };

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(conn.clone(), sink, queue));
        if let Ok(mut slot) = conn.inner.writer.lock() {
            *slot = Some(writer);
        }
        tokio::spawn(ReadLoop::new(conn.clone(), stream, dispatch_tx).run());
        tokio::spawn(dispatch_loop(conn.clone(), dispatch_rx));

        if conn.inner.secure.is_enabled() {
            let metrics = &conn.inner.ctx.metrics;
            metrics.handshake_attempt();
            let result = match side {
                Side::Initiator => conn.initiate_key_exchange().await,
                Side::Acceptor => conn.await_secured().await,
            };
            if let Err(e) = result {
                metrics.handshake_failed();
                warn!(id = conn.id(), error = %e, "Key exchange failed");
                conn.shutdown(LostReason::Security(e.to_string()));
                return Err(match e {
                    ProtocolError::ConnectionLost(_) | ProtocolError::SecurityError(_) => e,
                    other => ProtocolError::SecurityError(other.to_string()),
                });
            }
            metrics.handshake_success();
        }

        tokio::spawn(heartbeat_loop(conn.clone()));
        conn.inner.ctx.metrics.connection_established();
        info!(id = conn.id(), secure = ?conn.secure_state(), "Connection established");
        Ok(conn)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn transport(&self) -> TransportKind {
        self.inner.kind
    }

    pub fn local(&self) -> &str {
        &self.inner.local
    }

    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    pub fn secure_state(&self) -> SecureState {
        self.inner.secure.state()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.closed.borrow().is_none()
    }

    pub fn lost_reason(&self) -> Option<LostReason> {
        self.inner.closed.borrow().clone()
    }

    /// Requests still waiting for a response
    pub fn outstanding_requests(&self) -> usize {
        self.inner.correlator.outstanding()
    }

    /// Whether `T` has been announced to the peer on this connection.
    pub fn is_announced<T: Packet>(&self) -> bool {
        match self.inner.ctx.registry.lookup(T::NAME) {
            Ok(Some(entry)) => self.inner.peer_types.is_announced(entry.id),
            _ => false,
        }
    }

    /// Wait until the connection is closed and return why.
    pub async fn closed(&self) -> LostReason {
        let mut rx = self.inner.closed.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(LostReason::ClosedLocally),
            Err(_) => LostReason::ClosedLocally,
        };
        reason
    }

    /// Handle plain packets of type `T` on this connection only.
    pub fn on<T, F>(&self, handler: F) -> Result<()>
    where
        T: Packet,
        F: Fn(T, &Connection) + Send + Sync + 'static,
    {
        self.inner.handlers.on::<T, F>(&self.inner.ctx.registry, handler)
    }

    /// Answer requests of type `Req` on this connection only.
    pub fn on_request<Req, Resp, F>(&self, handler: F) -> Result<()>
    where
        Req: Packet,
        Resp: Packet,
        F: Fn(Req, &Connection) -> Result<Resp> + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .on_request::<Req, Resp, F>(&self.inner.ctx.registry, handler)
    }

    /// Send a plain packet, announcing its type first if the peer has not seen it.
    pub async fn send<T: Packet>(&self, packet: &T) -> Result<()> {
        let type_id = self.inner.ctx.registry.register::<T>()?;
        self.announce(type_id).await?;
        let body = encode_packet(packet)?;
        self.write(type_id, Envelope::plain(body)).await
    }

    /// Send a request and wait for its response with the default deadline.
    pub async fn send_request<Req: Packet, Resp: Packet>(&self, request: &Req) -> Result<Resp> {
        self.send_request_timeout(request, self.inner.options.request_timeout)
            .await
    }

    pub async fn send_request_timeout<Req: Packet, Resp: Packet>(
        &self,
        request: &Req,
        deadline: Duration,
    ) -> Result<Resp> {
        let registry = &self.inner.ctx.registry;
        let type_id = registry.register::<Req>()?;
        registry.register::<Resp>()?;
        self.announce(type_id).await?;

        let body = encode_packet(request)?;
        let pending = self.inner.correlator.register();
        let correlation_id = pending.id;
        self.inner.ctx.metrics.request_sent();
        if let Err(e) = self
            .write(type_id, Envelope::request(correlation_id, body))
            .await
        {
            self.inner.correlator.cancel(correlation_id);
            return Err(e);
        }

        let reply = match self.inner.correlator.wait(pending, deadline).await {
            Err(ProtocolError::Timeout) => {
                self.inner.ctx.metrics.request_timed_out();
                return Err(ProtocolError::Timeout);
            }
            other => other?,
        };
        match reply {
            Reply::Packet(packet) if packet.entry.name() == Resp::NAME => {
                Ok(serde_json::from_value(packet.value)?)
            }
            Reply::Packet(packet) => Err(ProtocolError::SerializationError(format!(
                "expected {} in response, got {}",
                Resp::NAME,
                packet.entry.name()
            ))),
            Reply::Control(_) => Err(ProtocolError::UnexpectedMessage),
        }
    }

    /// Close gracefully: tell the peer, flush queued frames, then stop.
    ///
    /// Never waits on the peer: with a full write queue the goodbye is dropped, and
    /// flushing is bounded by the shutdown timeout.
    pub async fn close(&self) {
        if !self.is_alive() {
            return;
        }
        let goodbye = ControlMessage::Disconnect
            .to_body()
            .and_then(|body| self.seal(type_ids::DISCONNECT, Envelope::plain(body)));
        if let Ok(frame) = goodbye {
            if self.inner.outbound.try_send(frame).is_err() {
                debug!(id = self.id(), "Write queue full, closing without a goodbye");
            }
        }
        self.shutdown(LostReason::ClosedLocally);

        let writer = self.inner.writer.lock().ok().and_then(|mut w| w.take());
        if let Some(writer) = writer {
            let _ = tokio::time::timeout(self.inner.options.shutdown_timeout, writer).await;
        }
    }

    /// Drop the transport without a goodbye. Queued frames are discarded.
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.shutdown(LostReason::ClosedLocally);
    }

    /// Record the close reason once and stop every task. Returns false if already closed.
    pub(crate) fn shutdown(&self, reason: LostReason) -> bool {
        let first = self.inner.closed.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(reason.clone());
                true
            } else {
                false
            }
        });
        if !first {
            return false;
        }

        info!(id = self.id(), remote = %self.remote(), %reason, "Connection closed");
        self.inner.secure.close();
        self.inner.cancel.cancel();
        self.inner.correlator.fail_all(&reason);
        self.inner.ctx.metrics.connection_lost();
        true
    }

    fn ensure_alive(&self) -> Result<()> {
        match self.lost_reason() {
            Some(reason) => Err(ProtocolError::ConnectionLost(reason)),
            None => Ok(()),
        }
    }

    fn seal(&self, type_id: u16, envelope: Envelope) -> Result<Frame> {
        self.ensure_alive()?;
        let frame = self.inner.secure.seal(type_id, envelope.to_bytes())?;
        if self.inner.kind == TransportKind::Udp && frame.encoded_len() > udp::MAX_DATAGRAM {
            return Err(ProtocolError::OversizedPacket(frame.encoded_len()));
        }
        Ok(frame)
    }

    /// Transform and queue one frame; waits while the write queue is full.
    async fn write(&self, type_id: u16, envelope: Envelope) -> Result<()> {
        let frame = self.seal(type_id, envelope)?;
        self.inner
            .outbound
            .send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Make sure the peer knows `type_id`; at most one round trip per type.
    async fn announce(&self, type_id: u16) -> Result<()> {
        let cell = self.inner.peer_types.outbound_cell(type_id)?;
        cell.get_or_try_init(|| self.register_with_peer(type_id))
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(id = self.inner.id))]
    async fn register_with_peer(&self, type_id: u16) -> Result<()> {
        let entry = self.inner.ctx.registry.resolve(type_id)?.ok_or_else(|| {
            ProtocolError::SerializationError(format!("type id {type_id:#06x} is not registered"))
        })?;
        self.inner.ctx.metrics.registration_sent();
        debug!(name = %entry.name(), "Announcing packet type");

        let reply = self
            .control_request(
                ControlMessage::RegisterType {
                    id: type_id,
                    descriptor: entry.descriptor.clone(),
                },
                self.inner.options.request_timeout,
            )
            .await?;
        match reply {
            Reply::Control(ControlMessage::RegisterTypeAck {
                id, accepted: true, ..
            }) if id == type_id => Ok(()),
            Reply::Control(ControlMessage::RegisterTypeAck {
                accepted: false,
                reason,
                ..
            }) => Err(ProtocolError::SerializationError(
                reason.unwrap_or_else(|| constants::ERR_UNKNOWN_TYPE.to_string()),
            )),
            _ => Err(ProtocolError::UnexpectedMessage),
        }
    }

    async fn control_request(&self, msg: ControlMessage, deadline: Duration) -> Result<Reply> {
        let body = msg.to_body()?;
        let pending = self.inner.correlator.register();
        let correlation_id = pending.id;
        if let Err(e) = self
            .write(msg.type_id(), Envelope::request(correlation_id, body))
            .await
        {
            self.inner.correlator.cancel(correlation_id);
            return Err(e);
        }
        self.inner.correlator.wait(pending, deadline).await
    }

    async fn respond_control(&self, correlation_id: u64, msg: ControlMessage) -> Result<()> {
        let body = msg.to_body()?;
        self.write(msg.type_id(), Envelope::response(correlation_id, body))
            .await
    }

    async fn initiate_key_exchange(&self) -> Result<()> {
        let init = self.inner.secure.begin_key_exchange()?;
        let reply = self
            .control_request(
                ControlMessage::KeyExchange(init),
                self.inner.options.connection_timeout,
            )
            .await?;
        match reply {
            Reply::Control(ControlMessage::KeyExchangeAck(_))
                if self.secure_state() == SecureState::Secured =>
            {
                Ok(())
            }
            _ => Err(ProtocolError::HandshakeError(
                constants::ERR_HANDSHAKE_FAILED.into(),
            )),
        }
    }

    async fn await_secured(&self) -> Result<()> {
        let mut rx = self.inner.secure.subscribe();
        let reached = with_timeout_error(
            async {
                let state = rx
                    .wait_for(|s| matches!(s, SecureState::Secured | SecureState::Closed))
                    .await
                    .map_err(|_| ProtocolError::ConnectionClosed)?;
                Ok::<_, ProtocolError>(*state)
            },
            self.inner.options.connection_timeout,
        )
        .await?;
        match reached {
            SecureState::Secured => Ok(()),
            _ => Err(ProtocolError::ConnectionLost(
                self.lost_reason().unwrap_or(LostReason::ClosedLocally),
            )),
        }
    }

    /// Run the handler for one inbound packet. Connection handlers win over container ones.
    async fn dispatch(&self, inbound: Inbound) {
        let name = inbound.packet.entry.name().to_string();
        let handler = match self.inner.handlers.get(&name) {
            Ok(Some(handler)) => Some(handler),
            _ => self.inner.ctx.handlers.get(&name).ok().flatten(),
        };

        match (handler.as_deref(), inbound.role) {
            (Some(Handler::Plain(f)), Role::Plain) => {
                if let Err(e) = f(inbound.packet.value, self) {
                    warn!(id = self.id(), packet = %name, error = %e, "Handler failed");
                }
            }
            (Some(Handler::Request(f)), Role::Request) => match f(inbound.packet.value, self) {
                Ok(response) => {
                    let sent = async {
                        self.announce(response.type_id).await?;
                        self.write(
                            response.type_id,
                            Envelope::response(inbound.correlation_id, response.body),
                        )
                        .await
                    };
                    if let Err(e) = sent.await {
                        warn!(id = self.id(), packet = %name, error = %e, "Response not sent");
                    }
                }
                Err(e) => warn!(id = self.id(), packet = %name, error = %e, "Request handler failed"),
            },
            (Some(_), role) => {
                debug!(id = self.id(), packet = %name, ?role, "Handler does not accept this role")
            }
            (None, role) => debug!(id = self.id(), packet = %name, ?role, "No handler registered"),
        }
    }
}

struct ReadLoop {
    conn: Connection,
    stream: FrameStream,
    dispatch: mpsc::UnboundedSender<Inbound>,
    /// Frames waiting for a type description, in arrival order
    held: VecDeque<(u16, Envelope)>,
    described: HashSet<u16>,
}

impl ReadLoop {
    fn new(conn: Connection, stream: FrameStream, dispatch: mpsc::UnboundedSender<Inbound>) -> Self {
        Self {
            conn,
            stream,
            dispatch,
            held: VecDeque::new(),
            described: HashSet::new(),
        }
    }

    async fn run(mut self) {
        let grace = self.conn.inner.options.connection_timeout;
        let cancel = self.conn.inner.cancel.clone();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = tokio::time::timeout(grace, self.stream.next()) => next,
            };
            let outcome = match next {
                Err(_) => Err(LostReason::Timeout),
                Ok(None) => Err(LostReason::TransportClosed),
                Ok(Some(Err(e))) => {
                    debug!(id = self.conn.id(), error = %e, "Read failed");
                    Err(e.lost_reason())
                }
                Ok(Some(Ok(frame))) => self.handle_frame(frame).await,
            };
            if let Err(reason) = outcome {
                self.conn.shutdown(reason);
                return;
            }
        }

        // closed locally: keep reading briefly so the peer's in-flight frames do not
        // turn our close into a reset
        if !self.conn.inner.aborted.load(Ordering::SeqCst) {
            let stream = &mut self.stream;
            let _ = tokio::time::timeout(CLOSE_LINGER, async move {
                while let Some(Ok(_)) = stream.next().await {}
            })
            .await;
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> std::result::Result<(), LostReason> {
        let metrics = Arc::clone(&self.conn.inner.ctx.metrics);
        metrics.packet_received(frame.encoded_len());
        let type_id = frame.type_id;

        let payload = self.conn.inner.secure.open(frame).map_err(|reason| {
            if reason.is_security() {
                metrics.security_failure();
            }
            reason
        })?;

        let envelope = match Envelope::from_bytes(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics.protocol_error();
                warn!(id = self.conn.id(), type_id, error = %e, "Skipping frame");
                return Ok(());
            }
        };

        if is_control(type_id) {
            self.handle_control(type_id, envelope).await
        } else {
            self.handle_application(type_id, envelope).await
        }
    }

    async fn handle_control(
        &mut self,
        type_id: u16,
        envelope: Envelope,
    ) -> std::result::Result<(), LostReason> {
        let inner = Arc::clone(&self.conn.inner);
        let msg = ControlMessage::from_body(type_id, &envelope.body).map_err(|e| {
            inner.ctx.metrics.protocol_error();
            LostReason::Protocol(e.to_string())
        })?;
        let correlation_id = envelope.correlation_id;
        let lost = |e: ProtocolError| e.lost_reason();

        match msg {
            ControlMessage::Heartbeat => trace!(id = inner.id, "Heartbeat"),
            ControlMessage::Disconnect => return Err(LostReason::PeerClosed),
            ControlMessage::KeyExchange(init) => {
                if !inner.secure.is_enabled() {
                    inner.ctx.metrics.security_failure();
                    return Err(LostReason::Security(
                        "peer requested a secure channel".to_string(),
                    ));
                }
                let ack = inner
                    .secure
                    .accept_key_exchange(&init, &inner.remote, &inner.ctx.replay_cache)
                    .map_err(|e| {
                        inner.ctx.metrics.security_failure();
                        LostReason::Security(e.to_string())
                    })?;
                self.conn
                    .respond_control(correlation_id, ControlMessage::KeyExchangeAck(ack))
                    .await
                    .map_err(lost)?;
                inner.secure.mark_secured();
            }
            ControlMessage::KeyExchangeAck(ref ack) => {
                inner.secure.finish_key_exchange(ack).map_err(|e| {
                    inner.ctx.metrics.security_failure();
                    LostReason::Security(e.to_string())
                })?;
                inner.correlator.complete(correlation_id, Reply::Control(msg));
            }
            ControlMessage::RegisterType { id, descriptor } => {
                let name = descriptor.name.clone();
                let (accepted, reason) = match inner.peer_types.accept(
                    &inner.ctx.registry,
                    id,
                    descriptor,
                    inner.options.accept_unknown_types,
                ) {
                    Ok(_) => {
                        inner.ctx.metrics.registration_accepted();
                        (true, None)
                    }
                    Err(e) => {
                        inner.ctx.metrics.registration_rejected();
                        warn!(id = inner.id, type_id = id, %name, error = %e, "Refusing peer type");
                        (false, Some(e.to_string()))
                    }
                };
                self.conn
                    .respond_control(
                        correlation_id,
                        ControlMessage::RegisterTypeAck {
                            id,
                            accepted,
                            reason,
                        },
                    )
                    .await
                    .map_err(lost)?;
                if accepted {
                    self.flush_held().await?;
                }
            }
            ControlMessage::DescribeType { id } => {
                let descriptor = inner
                    .ctx
                    .registry
                    .resolve(id)
                    .ok()
                    .flatten()
                    .map(|entry| entry.descriptor.clone());
                self.conn
                    .respond_control(
                        correlation_id,
                        ControlMessage::TypeDescription { id, descriptor },
                    )
                    .await
                    .map_err(lost)?;
            }
            ControlMessage::TypeDescription { id, descriptor } => {
                let descriptor = descriptor.ok_or_else(|| {
                    LostReason::Serialization(format!(
                        "{}: {id:#06x}",
                        constants::ERR_UNDESCRIBED_TYPE
                    ))
                })?;
                inner
                    .peer_types
                    .accept(
                        &inner.ctx.registry,
                        id,
                        descriptor,
                        inner.options.accept_unknown_types,
                    )
                    .map_err(|e| LostReason::Serialization(e.to_string()))?;
                self.flush_held().await?;
            }
            ControlMessage::RegisterTypeAck { .. } => {
                if envelope.role != Role::Response {
                    return Err(LostReason::Protocol(constants::ERR_UNEXPECTED_MESSAGE.into()));
                }
                if !inner.correlator.complete(correlation_id, Reply::Control(msg)) {
                    inner.ctx.metrics.late_response();
                }
            }
        }
        Ok(())
    }

    async fn handle_application(
        &mut self,
        type_id: u16,
        envelope: Envelope,
    ) -> std::result::Result<(), LostReason> {
        // once anything is held, later frames queue behind it to keep arrival order
        if !self.held.is_empty() {
            return self.hold(type_id, envelope);
        }
        let entry = self
            .conn
            .inner
            .peer_types
            .resolve(type_id)
            .map_err(|e| LostReason::Protocol(e.to_string()))?;
        match entry {
            Some(entry) => {
                self.deliver(entry, envelope);
                Ok(())
            }
            None => {
                self.hold(type_id, envelope)?;
                self.request_description(type_id).await
            }
        }
    }

    fn hold(&mut self, type_id: u16, envelope: Envelope) -> std::result::Result<(), LostReason> {
        if self.held.len() >= MAX_HELD_FRAMES {
            return Err(LostReason::Protocol(format!(
                "more than {MAX_HELD_FRAMES} frames of undescribed types"
            )));
        }
        self.held.push_back((type_id, envelope));
        Ok(())
    }

    async fn request_description(&mut self, type_id: u16) -> std::result::Result<(), LostReason> {
        if !self.described.insert(type_id) {
            return Ok(());
        }
        debug!(id = self.conn.id(), type_id, "Asking peer to describe type");
        let body = ControlMessage::DescribeType { id: type_id }
            .to_body()
            .map_err(|e| LostReason::Protocol(e.to_string()))?;
        self.conn
            .write(type_ids::DESCRIBE_TYPE, Envelope::request(0, body))
            .await
            .map_err(|e| e.lost_reason())
    }

    /// Deliver held frames from the front until one is still undescribed.
    async fn flush_held(&mut self) -> std::result::Result<(), LostReason> {
        while let Some(&(type_id, _)) = self.held.front() {
            let entry = self
                .conn
                .inner
                .peer_types
                .resolve(type_id)
                .map_err(|e| LostReason::Protocol(e.to_string()))?;
            match entry {
                Some(entry) => {
                    if let Some((_, envelope)) = self.held.pop_front() {
                        self.deliver(entry, envelope);
                    }
                }
                None => return self.request_description(type_id).await,
            }
        }
        Ok(())
    }

    fn deliver(&self, entry: Arc<TypeEntry>, envelope: Envelope) {
        let inner = &self.conn.inner;
        let value = match decode_value(&entry.descriptor.schema, &envelope.body) {
            Ok(value) => value,
            Err(e) => {
                inner.ctx.metrics.protocol_error();
                warn!(id = inner.id, packet = %entry.name(), error = %e, "Skipping undecodable packet");
                return;
            }
        };
        let packet = InboundPacket { entry, value };

        match envelope.role {
            Role::Response => {
                if !inner
                    .correlator
                    .complete(envelope.correlation_id, Reply::Packet(packet))
                {
                    inner.ctx.metrics.late_response();
                }
            }
            role => {
                let _ = self.dispatch.send(Inbound {
                    role,
                    correlation_id: envelope.correlation_id,
                    packet,
                });
            }
        }
    }
}

async fn write_loop(conn: Connection, mut sink: FrameSink, mut queue: mpsc::Receiver<Frame>) {
    let cancel = conn.inner.cancel.clone();
    let metrics = Arc::clone(&conn.inner.ctx.metrics);

    loop {
        let frame = tokio::select! {
            biased;
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        let len = frame.encoded_len();
        let sent = tokio::select! {
            biased;
            sent = sink.send(frame) => sent,
            // a peer that stopped reading must not hold the close up
            _ = cancel.cancelled() => break,
        };
        if let Err(e) = sent {
            debug!(id = conn.id(), error = %e, "Write failed");
            conn.shutdown(e.lost_reason());
            return;
        }
        metrics.packet_sent(len);
    }

    if conn.inner.aborted.load(Ordering::SeqCst) {
        return;
    }
    let drain = async {
        while let Ok(frame) = queue.try_recv() {
            let len = frame.encoded_len();
            if sink.send(frame).await.is_err() {
                break;
            }
            metrics.packet_sent(len);
        }
        close_quietly(&mut sink).await;
    };
    if tokio::time::timeout(conn.inner.options.shutdown_timeout, drain)
        .await
        .is_err()
    {
        warn!(id = conn.id(), "Write queue not drained before shutdown timeout");
    }
}

async fn dispatch_loop(conn: Connection, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    let cancel = conn.inner.cancel.clone();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = inbound.recv() => next,
        };
        match next {
            Some(packet) => conn.dispatch(packet).await,
            None => break,
        }
    }
}

async fn heartbeat_loop(conn: Connection) {
    let cancel = conn.inner.cancel.clone();
    let mut ticker = tokio::time::interval(conn.inner.options.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    let body = match ControlMessage::Heartbeat.to_body() {
        Ok(body) => Bytes::from(body),
        Err(_) => return,
    };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let frame = match conn.seal(type_ids::HEARTBEAT, Envelope::plain(body.clone())) {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                // a full queue means traffic is flowing anyway
                if conn.inner.outbound.try_send(frame).is_ok() {
                    conn.inner.ctx.metrics.heartbeat_sent();
                }
            }
        }
    }
}
