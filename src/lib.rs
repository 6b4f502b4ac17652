//! # packet-link
//!
//! Typed packet exchange between two endpoints over TCP, UDP or Bluetooth RFCOMM.
//!
//! Application code defines packet shapes (a [`Packet`] with a [`Schema`]) and
//! registers handlers; the crate owns framing, runtime type negotiation,
//! request/response correlation, the optional secure channel, keep-alive and
//! reconnection.
//!
//! ## Layers
//! - [`transport`]: sockets reduced to a stream and a sink of frames
//! - [`core`]: frame format, codec, envelope and schema-driven payload encoding
//! - [`protocol`]: type registry, correlation, handshake and the [`Connection`]
//! - [`service`]: [`Server`] and [`Client`] containers, secure channel
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging, metrics
//!
//! ## Example
//! ```no_run
//! use packet_link::{Client, FieldKind, NetworkConfig, Packet, Schema, Server};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct CalculationRequest { x: i32, y: i32 }
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct CalculationResponse { result: i32 }
//!
//! impl Packet for CalculationRequest {
//!     const NAME: &'static str = "demo.CalculationRequest";
//!     fn schema() -> Schema {
//!         Schema::new().field("x", FieldKind::I32).field("y", FieldKind::I32)
//!     }
//! }
//!
//! impl Packet for CalculationResponse {
//!     const NAME: &'static str = "demo.CalculationResponse";
//!     fn schema() -> Schema {
//!         Schema::new().field("result", FieldKind::I32)
//!     }
//! }
//!
//! # async fn run() -> packet_link::Result<()> {
//! let config = NetworkConfig::default();
//! let server = Server::bind(config.clone()).await?;
//! server.on_request(|req: CalculationRequest, _conn| {
//!     Ok(CalculationResponse { result: req.x + req.y })
//! })?;
//!
//! let client = Client::connect(config).await?;
//! let resp: CalculationResponse = client
//!     .send_request(&CalculationRequest { x: 3, y: 4 })
//!     .await?;
//! assert_eq!(resp.result, 7);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::NetworkConfig;
pub use crate::core::schema::{FieldKind, Packet, Schema, TypeDescriptor};
pub use crate::error::{LostReason, ProtocolError, Result};
pub use crate::protocol::connection::{Connection, ConnectionId};
pub use crate::service::{Client, ClientState, ConnectionEvent, Server};
pub use crate::transport::TransportKind;
