//! # Frame
//!
//! The wire unit. One frame carries exactly one packet.
//!
//! ```text
//! [Length(4)] [TypeId(2)] [Flags(1)] [Payload(Length)] [Signature(64), if signed]
//! ```
//!
//! All integers are big-endian. `Length` always equals the payload size after every
//! transform (compression, encryption), so a reader can buffer partial input until
//! `7 + Length (+ 64)` bytes are present.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{constants, ProtocolError, Result};

/// `length(4) + type_id(2) + flags(1)`
pub const HEADER_LEN: usize = 7;

/// Ed25519 signature length
pub const SIGNATURE_LEN: usize = 64;

bitflags! {
    /// Per-frame transform flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u8 {
        const ENCRYPTED = 0b0000_0001;
        const SIGNED = 0b0000_0010;
        const LZ4 = 0b0000_0100;
        const ZSTD = 0b0000_1000;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub type_id: u16,
    pub flags: FrameFlags,
    pub payload: Bytes,
    pub signature: Option<[u8; SIGNATURE_LEN]>,
}

impl Frame {
    pub fn new(type_id: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            type_id,
            flags: FrameFlags::empty(),
            payload: payload.into(),
            signature: None,
        }
    }

    /// Total encoded size of this frame
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + self.payload.len()
            + if self.signature.is_some() {
                SIGNATURE_LEN
            } else {
                0
            }
    }

    /// Bytes covered by the signature: type id, flags and payload.
    pub fn signed_bytes(type_id: u16, flags: FrameFlags, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + payload.len());
        buf.put_u16(type_id);
        buf.put_u8(flags.bits());
        buf.put_slice(payload);
        buf
    }

    pub fn encode_into(&self, dst: &mut BytesMut, max_payload: usize) -> Result<()> {
        if self.payload.len() > max_payload {
            return Err(ProtocolError::OversizedPacket(self.payload.len()));
        }
        if self.flags.contains(FrameFlags::SIGNED) != self.signature.is_some() {
            return Err(ProtocolError::InvalidHeader);
        }

        dst.reserve(self.encoded_len());
        dst.put_u32(self.payload.len() as u32);
        dst.put_u16(self.type_id);
        dst.put_u8(self.flags.bits());
        dst.put_slice(&self.payload);
        if let Some(signature) = &self.signature {
            dst.put_slice(signature);
        }
        Ok(())
    }

    pub fn to_bytes(&self, max_payload: usize) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf, max_payload)?;
        Ok(buf.freeze())
    }

    /// Try to decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, otherwise the frame and the number
    /// of bytes it occupied. The length claim is checked against `max_payload` before
    /// anything is allocated.
    pub fn decode(src: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &src[..HEADER_LEN];
        let length = header.get_u32() as usize;
        let type_id = header.get_u16();
        let flags = FrameFlags::from_bits(header.get_u8()).ok_or(ProtocolError::InvalidHeader)?;

        if length > max_payload {
            return Err(ProtocolError::OversizedPacket(length));
        }

        let signed = flags.contains(FrameFlags::SIGNED);
        let total = HEADER_LEN + length + if signed { SIGNATURE_LEN } else { 0 };
        if src.len() < total {
            return Ok(None);
        }

        let payload_end = HEADER_LEN + length;
        let payload = Bytes::copy_from_slice(&src[HEADER_LEN..payload_end]);
        let signature = if signed {
            let mut sig = [0u8; SIGNATURE_LEN];
            sig.copy_from_slice(&src[payload_end..total]);
            Some(sig)
        } else {
            None
        };

        Ok(Some((
            Frame {
                type_id,
                flags,
                payload,
                signature,
            },
            total,
        )))
    }

    /// Decode a datagram that must hold exactly one complete frame.
    pub fn decode_datagram(datagram: &[u8], max_payload: usize) -> Result<Frame> {
        match Frame::decode(datagram, max_payload)? {
            Some((frame, used)) if used == datagram.len() => Ok(frame),
            Some(_) => Err(ProtocolError::MalformedFrame(
                constants::ERR_DATAGRAM_TRAILING.into(),
            )),
            None => Err(ProtocolError::MalformedFrame(
                constants::ERR_DATAGRAM_INCOMPLETE.into(),
            )),
        }
    }
}
