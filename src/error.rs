//! # Error Types
//!
//! Error handling for every layer of the packet link.
//!
//! This module defines all error variants that can occur while exchanging packets,
//! from low-level socket failures to protocol violations detected on the read loop.
//!
//! ## Error Categories
//! - **Transport Errors**: failure to open, send on, or receive from a socket
//! - **Serialization Errors**: unknown or unregisterable types, malformed frames
//! - **Security Errors**: handshake failure, signature or decryption mismatch
//! - **Timeouts**: request deadline exceeded
//! - **Connection Lost**: heartbeat grace exceeded or transport closed
//!
//! Application code only ever sees these through failed sends, failed or timed-out
//! requests, and the [`LostReason`] carried by `Lost` events.
//!
//! ## Example Usage
//! ```rust
//! use packet_link::error::{ProtocolError, Result};
//! use tracing::{error, info};
//!
//! fn check_len(len: usize) -> Result<usize> {
//!     if len > 16 {
//!         return Err(ProtocolError::OversizedPacket(len));
//!     }
//!     Ok(len)
//! }
//!
//! match check_len(32) {
//!     Ok(len) => info!(len, "accepted"),
//!     Err(e) => error!(error = %e, "rejected"),
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";
    pub const ERR_REGISTRY_LOCK: &str = "Failed to acquire type registry lock";

    /// Frame validation errors
    pub const ERR_INVALID_ENVELOPE: &str = "Invalid packet envelope";
    pub const ERR_DATAGRAM_TRAILING: &str = "Datagram carries more than one frame";
    pub const ERR_DATAGRAM_INCOMPLETE: &str = "Datagram carries an incomplete frame";

    /// Cryptographic errors
    pub const ERR_DECRYPTION_FAILED: &str = "Decryption failed";
    pub const ERR_SIGNATURE_INVALID: &str = "Frame signature verification failed";
    pub const ERR_SIGNATURE_MISSING: &str = "Secured frame is not signed";
    pub const ERR_PLAINTEXT_WHEN_SECURED: &str = "Unencrypted frame on a secured channel";
    pub const ERR_ENCRYPTED_WHEN_INSECURE: &str = "Encrypted frame on an insecure channel";
    pub const ERR_NOT_BOOTSTRAP: &str = "Non-bootstrap frame during key exchange";

    /// Type negotiation errors
    pub const ERR_UNKNOWN_TYPE: &str = "Peer has no type with this name";
    pub const ERR_SCHEMA_MISMATCH: &str = "Schema differs from the locally registered shape";
    pub const ERR_TYPE_ID_EXHAUSTED: &str = "No application type ids left";
    pub const ERR_UNDESCRIBED_TYPE: &str = "Peer could not describe type id";

    /// Protocol negotiation errors
    pub const ERR_HANDSHAKE_FAILED: &str = "Handshake failed";
    pub const ERR_UNEXPECTED_MESSAGE: &str = "Unexpected message type";
    pub const ERR_KEY_SIZE_MISMATCH: &str = "Peer announced an unsupported key size";
    pub const ERR_INVALID_VERIFYING_KEY: &str = "Peer announced an invalid verifying key";

    /// Handshake-specific errors
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
    pub const ERR_INVALID_TIMESTAMP: &str = "Invalid or stale timestamp";
    pub const ERR_REPLAY_ATTACK: &str = "Replay attack detected - nonce/timestamp already seen";
    pub const ERR_NONCE_VERIFICATION_FAILED: &str = "Server failed to verify client nonce";
}

/// Why a connection stopped being alive.
///
/// Exactly one reason is recorded per connection; it is carried by the container's
/// `Lost` event and by every pending request that was failed by the close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LostReason {
    /// The peer announced an orderly disconnect.
    PeerClosed,
    /// The socket reported EOF, reset or a write failure.
    TransportClosed,
    /// Nothing was received within the inactivity grace period.
    Timeout,
    /// A frame or control packet violated the protocol.
    Protocol(String),
    /// Type negotiation failed in a way that leaves the stream undecodable.
    Serialization(String),
    /// Handshake failure, bad signature or undecryptable frame.
    Security(String),
    /// Closed by this side.
    ClosedLocally,
}

impl LostReason {
    pub fn is_security(&self) -> bool {
        matches!(self, LostReason::Security(_))
    }
}

impl fmt::Display for LostReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LostReason::PeerClosed => write!(f, "peer closed"),
            LostReason::TransportClosed => write!(f, "transport closed"),
            LostReason::Timeout => write!(f, "timeout"),
            LostReason::Protocol(detail) => write!(f, "protocol error: {detail}"),
            LostReason::Serialization(detail) => write!(f, "serialization error: {detail}"),
            LostReason::Security(detail) => write!(f, "security error: {detail}"),
            LostReason::ClosedLocally => write!(f, "closed locally"),
        }
    }
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection lost: {0}")]
    ConnectionLost(LostReason),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Unexpected message type")]
    UnexpectedMessage,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection timed out (no activity)")]
    ConnectionTimeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Map an error seen on the read or write path to the reason the connection dies with.
    pub fn lost_reason(&self) -> LostReason {
        match self {
            ProtocolError::Io(_)
            | ProtocolError::ConnectionClosed
            | ProtocolError::TransportError(_) => LostReason::TransportClosed,
            ProtocolError::ConnectionTimeout | ProtocolError::Timeout => LostReason::Timeout,
            ProtocolError::ConnectionLost(reason) => reason.clone(),
            ProtocolError::SecurityError(detail) | ProtocolError::HandshakeError(detail) => {
                LostReason::Security(detail.clone())
            }
            ProtocolError::DecryptionFailure | ProtocolError::EncryptionFailure => {
                LostReason::Security(self.to_string())
            }
            ProtocolError::SerializationError(detail) => LostReason::Serialization(detail.clone()),
            ProtocolError::Bincode(e) => LostReason::Serialization(e.to_string()),
            other => LostReason::Protocol(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::SerializationError(e.to_string())
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
