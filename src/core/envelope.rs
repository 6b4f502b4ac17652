//! Role and correlation header carried at the start of every frame payload.
//!
//! ```text
//! [Role(1)] [CorrelationId(8, big-endian)] [Body(N)]
//! ```
//!
//! The envelope sits inside the payload, so it is compressed and encrypted along with
//! the body on a secured channel.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{constants, ProtocolError, Result};

pub const ENVELOPE_LEN: usize = 9;

/// Role tag of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Plain,
    Request,
    Response,
}

impl Role {
    pub fn as_byte(self) -> u8 {
        match self {
            Role::Plain => 0,
            Role::Request => 1,
            Role::Response => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Role::Plain),
            1 => Some(Role::Request),
            2 => Some(Role::Response),
            _ => None,
        }
    }
}

/// A packet body together with its role and correlation id.
///
/// For `Request` the id is freshly minted by the sender; for `Response` it echoes the
/// request's id; for `Plain` it is zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub role: Role,
    pub correlation_id: u64,
    pub body: Bytes,
}

impl Envelope {
    pub fn plain(body: impl Into<Bytes>) -> Self {
        Self {
            role: Role::Plain,
            correlation_id: 0,
            body: body.into(),
        }
    }

    pub fn request(correlation_id: u64, body: impl Into<Bytes>) -> Self {
        Self {
            role: Role::Request,
            correlation_id,
            body: body.into(),
        }
    }

    pub fn response(correlation_id: u64, body: impl Into<Bytes>) -> Self {
        Self {
            role: Role::Response,
            correlation_id,
            body: body.into(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENVELOPE_LEN + self.body.len());
        buf.put_u8(self.role.as_byte());
        buf.put_u64(self.correlation_id);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    pub fn from_bytes(mut bytes: Bytes) -> Result<Self> {
        if bytes.len() < ENVELOPE_LEN {
            return Err(ProtocolError::SerializationError(
                constants::ERR_INVALID_ENVELOPE.into(),
            ));
        }
        let role = Role::from_byte(bytes.get_u8()).ok_or_else(|| {
            ProtocolError::SerializationError(constants::ERR_INVALID_ENVELOPE.into())
        })?;
        let correlation_id = bytes.get_u64();
        Ok(Self {
            role,
            correlation_id,
            body: bytes,
        })
    }
}
