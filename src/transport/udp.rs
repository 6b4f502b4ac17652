//! UDP transport.
//!
//! Each datagram holds exactly one frame. The server side binds one socket and
//! demultiplexes it by source address: the first datagram from a new address opens a
//! new [`Link`], later datagrams from that address feed the same link.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

use crate::core::frame::Frame;
use crate::error::{ProtocolError, Result};
use crate::transport::{FrameSink, FrameStream, Link, TransportKind};

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM: usize = 65_507;

/// Datagrams queued per peer before further ones are dropped
const PEER_QUEUE: usize = 256;

fn datagram(frame: &Frame, max_payload: usize) -> Result<Bytes> {
    let bytes = frame.to_bytes(max_payload)?;
    if bytes.len() > MAX_DATAGRAM {
        return Err(ProtocolError::OversizedPacket(bytes.len()));
    }
    Ok(bytes)
}

fn sink_to(socket: Arc<UdpSocket>, peer: Option<SocketAddr>, max_payload: usize) -> FrameSink {
    Box::pin(futures::sink::unfold(
        socket,
        move |socket, frame: Frame| async move {
            let bytes = datagram(&frame, max_payload)?;
            match peer {
                Some(peer) => socket.send_to(&bytes, peer).await?,
                None => socket.send(&bytes).await?,
            };
            Ok::<_, ProtocolError>(socket)
        },
    ))
}

#[instrument(fields(transport = "udp"))]
pub async fn connect(address: &str, max_payload: usize) -> Result<Link> {
    let target: SocketAddr = address
        .parse()
        .map_err(|e| ProtocolError::TransportError(format!("invalid UDP address {address}: {e}")))?;
    let bind = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;
    let local = socket.local_addr()?.to_string();
    let socket = Arc::new(socket);

    let reader = Arc::clone(&socket);
    let stream: FrameStream = Box::pin(futures::stream::unfold(
        (reader, vec![0u8; MAX_DATAGRAM + 1]),
        move |(socket, mut buf)| async move {
            let item = match socket.recv(&mut buf).await {
                Ok(n) => Frame::decode_datagram(&buf[..n], max_payload),
                Err(e) => Err(ProtocolError::Io(e)),
            };
            Some((item, (socket, buf)))
        },
    ));

    debug!(address, "UDP socket connected");
    Ok(Link {
        kind: TransportKind::Udp,
        local,
        remote: target.to_string(),
        stream,
        sink: sink_to(socket, None, max_payload),
    })
}

pub struct UdpLinkListener {
    local: String,
    incoming: mpsc::Receiver<Link>,
    peers: Arc<AtomicUsize>,
    demux: JoinHandle<()>,
}

impl UdpLinkListener {
    pub async fn bind(address: &str, max_payload: usize) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(address).await?);
        let local = socket.local_addr()?.to_string();
        info!(address = %local, "Listening on UDP");

        let (tx, incoming) = mpsc::channel(64);
        let peers = Arc::new(AtomicUsize::new(0));
        let demux = tokio::spawn(demultiplex(
            socket,
            local.clone(),
            tx,
            Arc::clone(&peers),
            max_payload,
        ));
        Ok(Self {
            local,
            incoming,
            peers,
            demux,
        })
    }

    pub fn local_addr(&self) -> String {
        self.local.clone()
    }

    /// Source addresses that currently have a live link
    pub fn peer_count(&self) -> usize {
        self.peers.load(Ordering::Relaxed)
    }

    pub async fn accept(&mut self) -> Result<Link> {
        self.incoming
            .recv()
            .await
            .ok_or(ProtocolError::ConnectionClosed)
    }
}

impl Drop for UdpLinkListener {
    fn drop(&mut self) {
        self.demux.abort();
    }
}

async fn demultiplex(
    socket: Arc<UdpSocket>,
    local: String,
    incoming: mpsc::Sender<Link>,
    peer_count: Arc<AtomicUsize>,
    max_payload: usize,
) {
    let mut peers: HashMap<SocketAddr, mpsc::Sender<Result<Frame>>> = HashMap::new();
    // addresses whose link was dropped
    let (gone_tx, mut gone) = mpsc::unbounded_channel::<SocketAddr>();
    let mut buf = vec![0u8; MAX_DATAGRAM + 1];

    loop {
        let received = tokio::select! {
            Some(addr) = gone.recv() => {
                // a newer link may already own the address
                if peers.get(&addr).is_some_and(|tx| tx.is_closed()) {
                    peers.remove(&addr);
                    peer_count.store(peers.len(), Ordering::Relaxed);
                    debug!(peer = %addr, "UDP peer released");
                }
                continue;
            }
            received = socket.recv_from(&mut buf) => received,
        };
        let (n, from) = match received {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "UDP receive failed");
                continue;
            }
        };
        let item = Frame::decode_datagram(&buf[..n], max_payload);

        let item = match peers.get(&from) {
            Some(tx) => match tx.try_send(item) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(peer = %from, "Peer queue full, dropping datagram");
                    continue;
                }
                // the connection for this address is gone; treat it as a new peer
                Err(mpsc::error::TrySendError::Closed(item)) => item,
            },
            None => item,
        };

        let (tx, rx) = mpsc::channel(PEER_QUEUE);
        let _ = tx.try_send(item);
        let watched = tx.clone();
        let gone_tx = gone_tx.clone();
        tokio::spawn(async move {
            watched.closed().await;
            let _ = gone_tx.send(from);
        });
        peers.insert(from, tx);
        peer_count.store(peers.len(), Ordering::Relaxed);

        let link = Link {
            kind: TransportKind::Udp,
            local: local.clone(),
            remote: from.to_string(),
            stream: Box::pin(ReceiverStream::new(rx)),
            sink: sink_to(Arc::clone(&socket), Some(from), max_payload),
        };
        debug!(peer = %from, "New UDP peer");
        if incoming.send(link).await.is_err() {
            break;
        }
    }
}
