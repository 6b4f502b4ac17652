//! # Protocol Layer
//!
//! Everything that turns a [`Link`](crate::transport::Link) into a typed packet
//! conversation.
//!
//! ## Components
//! - **Message**: control packets in the reserved type-id range
//! - **Registry**: local type registry and the per-connection peer type view
//! - **Correlation**: request/response matching with deadlines
//! - **Handshake**: X25519 key agreement with nonce verification and replay protection
//! - **Dispatcher**: handler table keyed by packet name
//! - **Connection**: read loop, write queue, heartbeat and lifecycle of one peer
//!
//! ## Negotiation
//! Numeric type ids are local to each side. Before the first packet of a type goes
//! out, the sender announces `(id, name, schema)` once per connection; the receiver
//! binds that id to its own type of the same name and shape, or refuses it.

pub mod connection;
pub mod correlation;
pub mod dispatcher;
pub mod handshake;
pub mod message;
pub mod registry;

#[cfg(test)]
mod tests;
