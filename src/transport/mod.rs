//! # Transports
//!
//! Every transport is reduced to a [`Link`]: a stream of inbound frames and a sink for
//! outbound frames. Byte-stream sockets (TCP, Bluetooth RFCOMM, in-memory pipes) are
//! framed with [`FrameCodec`]; datagram sockets (UDP) carry exactly one frame per
//! datagram.
//!
//! End of stream, reset and broken pipe surface as `Err(ConnectionClosed)` or `Io`
//! on the link, never as a silent stop.

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::core::codec::FrameCodec;
use crate::core::frame::Frame;
use crate::error::{ProtocolError, Result};

#[cfg(feature = "bluetooth")]
pub mod bluetooth;
pub mod tcp;
pub mod udp;

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = ProtocolError> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Udp,
    Bluetooth,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
            TransportKind::Bluetooth => write!(f, "bluetooth"),
        }
    }
}

/// One open socket, split into its read and write halves.
pub struct Link {
    pub kind: TransportKind,
    pub local: String,
    pub remote: String,
    pub stream: FrameStream,
    pub sink: FrameSink,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("kind", &self.kind)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}

impl Link {
    /// Frame any byte stream with the length-prefixed codec.
    pub fn from_io<T>(
        kind: TransportKind,
        local: impl Into<String>,
        remote: impl Into<String>,
        io: T,
        max_payload: usize,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (sink, stream) = Framed::new(io, FrameCodec::new(max_payload)).split();
        Self {
            kind,
            local: local.into(),
            remote: remote.into(),
            stream: Box::pin(stream),
            sink: Box::pin(sink),
        }
    }

    /// Two links joined by an in-memory pipe, for tests and in-process peers.
    pub fn pair(max_payload: usize) -> (Link, Link) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Link::from_io(TransportKind::Tcp, "memory:a", "memory:b", a, max_payload),
            Link::from_io(TransportKind::Tcp, "memory:b", "memory:a", b, max_payload),
        )
    }
}

/// Where a client connects.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub kind: TransportKind,
    pub address: String,
    pub channel: u8,
}

/// Open a link to `endpoint`, bounded by `connect_timeout`.
pub async fn open(
    endpoint: &Endpoint,
    max_payload: usize,
    connect_timeout: Duration,
) -> Result<Link> {
    let fut = async {
        match endpoint.kind {
            TransportKind::Tcp => tcp::connect(&endpoint.address, max_payload).await,
            TransportKind::Udp => udp::connect(&endpoint.address, max_payload).await,
            #[cfg(feature = "bluetooth")]
            TransportKind::Bluetooth => {
                bluetooth::connect(&endpoint.address, endpoint.channel, max_payload).await
            }
            #[cfg(not(feature = "bluetooth"))]
            TransportKind::Bluetooth => Err(ProtocolError::TransportError(
                "bluetooth support not compiled in".into(),
            )),
        }
    };
    match tokio::time::timeout(connect_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::TransportError(format!(
            "connect to {} {} timed out",
            endpoint.kind, endpoint.address
        ))),
    }
}

/// A bound listening socket of any kind.
pub enum Listener {
    Tcp(tcp::TcpLinkListener),
    Udp(udp::UdpLinkListener),
    #[cfg(feature = "bluetooth")]
    Bluetooth(bluetooth::RfcommLinkListener),
}

impl Listener {
    pub fn kind(&self) -> TransportKind {
        match self {
            Listener::Tcp(_) => TransportKind::Tcp,
            Listener::Udp(_) => TransportKind::Udp,
            #[cfg(feature = "bluetooth")]
            Listener::Bluetooth(_) => TransportKind::Bluetooth,
        }
    }

    pub fn local_addr(&self) -> String {
        match self {
            Listener::Tcp(l) => l.local_addr(),
            Listener::Udp(l) => l.local_addr(),
            #[cfg(feature = "bluetooth")]
            Listener::Bluetooth(l) => l.local_addr(),
        }
    }

    pub async fn accept(&mut self) -> Result<Link> {
        match self {
            Listener::Tcp(l) => l.accept().await,
            Listener::Udp(l) => l.accept().await,
            #[cfg(feature = "bluetooth")]
            Listener::Bluetooth(l) => l.accept().await,
        }
    }
}

/// Close a sink, ignoring failures from an already-dead socket.
pub(crate) async fn close_quietly(sink: &mut FrameSink) {
    let _ = sink.close().await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::MAX_PAYLOAD_SIZE;

    #[tokio::test]
    async fn test_pair_carries_frames_both_ways() {
        let (mut a, mut b) = Link::pair(MAX_PAYLOAD_SIZE);
        a.sink.send(Frame::new(0x0100, vec![1, 2, 3])).await.unwrap();
        let frame = b.stream.next().await.unwrap().unwrap();
        assert_eq!(&frame.payload[..], &[1, 2, 3]);

        b.sink.send(Frame::new(0x0101, vec![])).await.unwrap();
        assert_eq!(a.stream.next().await.unwrap().unwrap().type_id, 0x0101);
    }

    #[tokio::test]
    async fn test_dropped_peer_ends_stream() {
        let (a, mut b) = Link::pair(MAX_PAYLOAD_SIZE);
        drop(a);
        assert!(b.stream.next().await.is_none());
    }
}
