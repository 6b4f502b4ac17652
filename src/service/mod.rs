//! # Service Layer
//!
//! Connection containers and the per-connection secure channel.
//!
//! ## Components
//! - **Server**: listeners per enabled transport, connection set, broadcast
//! - **Client**: one supervised connection with auto-reconnect
//! - **Secure**: key-exchange state machine and frame encryption/signing
//! - **Events**: `Established`/`Lost` notifications
//! - **Backoff**: reconnect delay schedule

pub mod backoff;
pub mod client;
pub mod events;
pub mod secure;
pub mod server;

pub use client::{Client, ClientState};
pub use events::ConnectionEvent;
pub use server::Server;
