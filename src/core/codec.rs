//! Tokio codec that absorbs partial reads on byte-stream transports.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::frame::{Frame, HEADER_LEN};
use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match Frame::decode(src, self.max_payload)? {
            Some((frame, used)) => {
                src.advance(used);
                Ok(Some(frame))
            }
            None => {
                // Reserve room for the rest of the frame once its length is known
                if src.len() >= HEADER_LEN {
                    let claimed = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
                    src.reserve((HEADER_LEN + claimed).saturating_sub(src.len()));
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        frame.encode_into(dst, self.max_payload)
    }
}
