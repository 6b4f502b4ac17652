//! Protocol-internal control packets.
//!
//! Control packets use the reserved type-id range below [`type_ids::FIRST_APPLICATION`]
//! and never reach application handlers. Their bodies are `bincode`.

use serde::{Deserialize, Serialize};

use crate::core::schema::TypeDescriptor;
use crate::error::{constants, ProtocolError, Result};

/// Largest control body accepted from a peer
pub const MAX_CONTROL_BODY: usize = 64 * 1024;

pub mod type_ids {
    pub const HEARTBEAT: u16 = 0x0001;
    pub const DISCONNECT: u16 = 0x0002;
    pub const KEY_EXCHANGE: u16 = 0x0010;
    pub const KEY_EXCHANGE_ACK: u16 = 0x0011;
    pub const REGISTER_TYPE: u16 = 0x0020;
    pub const REGISTER_TYPE_ACK: u16 = 0x0021;
    pub const DESCRIBE_TYPE: u16 = 0x0022;
    pub const TYPE_DESCRIPTION: u16 = 0x0023;

    /// First id handed out to application packet types
    pub const FIRST_APPLICATION: u16 = 0x0100;
}

/// Client half of the key exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangeInit {
    /// X25519 ephemeral public key
    pub public_key: [u8; 32],
    /// Ed25519 key that will sign this side's frames
    pub verifying_key: [u8; 32],
    /// Session key size in bits
    pub key_size: u16,
    pub nonce: [u8; 16],
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

/// Server half of the key exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangeAck {
    pub public_key: [u8; 32],
    pub verifying_key: [u8; 32],
    pub key_size: u16,
    pub nonce: [u8; 16],
    /// SHA-256 of the client nonce
    pub nonce_verification: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    Heartbeat,
    Disconnect,
    KeyExchange(KeyExchangeInit),
    KeyExchangeAck(KeyExchangeAck),
    /// Announce the id this side will use for a type from now on
    RegisterType {
        id: u16,
        descriptor: TypeDescriptor,
    },
    RegisterTypeAck {
        id: u16,
        accepted: bool,
        reason: Option<String>,
    },
    /// Ask the peer what one of its ids means
    DescribeType {
        id: u16,
    },
    TypeDescription {
        id: u16,
        descriptor: Option<TypeDescriptor>,
    },
}

impl ControlMessage {
    pub fn type_id(&self) -> u16 {
        match self {
            ControlMessage::Heartbeat => type_ids::HEARTBEAT,
            ControlMessage::Disconnect => type_ids::DISCONNECT,
            ControlMessage::KeyExchange(_) => type_ids::KEY_EXCHANGE,
            ControlMessage::KeyExchangeAck(_) => type_ids::KEY_EXCHANGE_ACK,
            ControlMessage::RegisterType { .. } => type_ids::REGISTER_TYPE,
            ControlMessage::RegisterTypeAck { .. } => type_ids::REGISTER_TYPE_ACK,
            ControlMessage::DescribeType { .. } => type_ids::DESCRIBE_TYPE,
            ControlMessage::TypeDescription { .. } => type_ids::TYPE_DESCRIPTION,
        }
    }

    pub fn to_body(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a control body and check it matches the frame's type id.
    pub fn from_body(type_id: u16, body: &[u8]) -> Result<Self> {
        if body.len() > MAX_CONTROL_BODY {
            return Err(ProtocolError::OversizedPacket(body.len()));
        }
        let msg: ControlMessage = bincode::deserialize(body)?;
        if msg.type_id() != type_id {
            return Err(ProtocolError::MalformedFrame(
                constants::ERR_UNEXPECTED_MESSAGE.into(),
            ));
        }
        Ok(msg)
    }
}

pub fn is_control(type_id: u16) -> bool {
    type_id < type_ids::FIRST_APPLICATION
}

/// Packets that may cross the wire unencrypted while the key exchange is running.
pub fn is_bootstrap(type_id: u16) -> bool {
    matches!(
        type_id,
        type_ids::DISCONNECT
            | type_ids::KEY_EXCHANGE
            | type_ids::KEY_EXCHANGE_ACK
            | type_ids::REGISTER_TYPE
            | type_ids::REGISTER_TYPE_ACK
            | type_ids::DESCRIBE_TYPE
            | type_ids::TYPE_DESCRIPTION
    )
}
