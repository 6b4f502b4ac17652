//! Bluetooth RFCOMM transport (Linux/BlueZ).
//!
//! RFCOMM is a byte stream, so it is framed exactly like TCP. Device discovery is
//! out of scope: the peer address and channel come from configuration.

use bluer::rfcomm::{Listener, SocketAddr, Stream};
use bluer::Address;
use std::str::FromStr;
use tracing::{debug, info, instrument};

use crate::error::{ProtocolError, Result};
use crate::transport::{Link, TransportKind};

fn parse_address(address: &str) -> Result<Address> {
    Address::from_str(address)
        .map_err(|e| ProtocolError::TransportError(format!("invalid bluetooth address {address}: {e}")))
}

fn describe(addr: &SocketAddr) -> String {
    format!("{}#{}", addr.addr, addr.channel)
}

#[instrument(fields(transport = "bluetooth"))]
pub async fn connect(address: &str, channel: u8, max_payload: usize) -> Result<Link> {
    let target = SocketAddr::new(parse_address(address)?, channel);
    let stream = Stream::connect(target).await?;
    let local = describe(&stream.as_ref().local_addr()?);
    debug!(address, channel, "RFCOMM connected");
    Ok(Link::from_io(
        TransportKind::Bluetooth,
        local,
        describe(&target),
        stream,
        max_payload,
    ))
}

pub struct RfcommLinkListener {
    listener: Listener,
    local: String,
    max_payload: usize,
}

impl RfcommLinkListener {
    pub async fn bind(address: &str, channel: u8, max_payload: usize) -> Result<Self> {
        let local_addr = SocketAddr::new(parse_address(address)?, channel);
        let listener = Listener::bind(local_addr).await?;
        let local = describe(&listener.as_ref().local_addr()?);
        info!(address = %local, "Listening on RFCOMM");
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
        debug!(peer = %describe(&peer), "Accepted RFCOMM connection");
        Ok(Link::from_io(
            TransportKind::Bluetooth,
            self.local.clone(),
            describe(&peer),
            stream,
            self.max_payload,
        ))
    }
}
