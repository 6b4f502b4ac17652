//! Lifecycle notifications raised by the server and client containers.

use crate::error::LostReason;
use crate::protocol::connection::{Connection, ConnectionId};
use crate::transport::TransportKind;

/// Events buffered per subscriber before the slowest one starts lagging
pub const EVENT_CAPACITY: usize = 256;

/// Exactly one `Established` and one `Lost` is raised per connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Established(Connection),
    Lost {
        id: ConnectionId,
        remote: String,
        transport: TransportKind,
        reason: LostReason,
    },
}

impl ConnectionEvent {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            ConnectionEvent::Established(conn) => conn.id(),
            ConnectionEvent::Lost { id, .. } => *id,
        }
    }

    pub(crate) fn lost(conn: &Connection, reason: LostReason) -> Self {
        ConnectionEvent::Lost {
            id: conn.id(),
            remote: conn.remote().to_string(),
            transport: conn.transport(),
            reason,
        }
    }
}
