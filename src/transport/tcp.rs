//! TCP transport.

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::transport::{Link, TransportKind};

fn link(stream: TcpStream, max_payload: usize) -> Result<Link> {
    stream.set_nodelay(true)?;
    let local = stream.local_addr()?.to_string();
    let remote = stream.peer_addr()?.to_string();
    Ok(Link::from_io(TransportKind::Tcp, local, remote, stream, max_payload))
}

#[instrument(fields(transport = "tcp"))]
pub async fn connect(address: &str, max_payload: usize) -> Result<Link> {
    let stream = TcpStream::connect(address).await?;
    debug!(address, "TCP connected");
    link(stream, max_payload)
}

pub struct TcpLinkListener {
    listener: TcpListener,
    local: String,
    max_payload: usize,
}

impl TcpLinkListener {
    pub async fn bind(address: &str, max_payload: usize) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local = listener.local_addr()?.to_string();
        info!(address = %local, "Listening on TCP");
        Ok(Self {
            listener,
            local,
            max_payload,
        })
    }

    pub fn local_addr(&self) -> String {
        self.local.clone()
    }

    pub async fn accept(&mut self) -> Result<Link> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(%peer, "Accepted TCP connection");
        link(stream, self.max_payload)
    }
}
