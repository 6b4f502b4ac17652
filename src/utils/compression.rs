//! Payload compression applied before encryption.
//!
//! The chosen algorithm travels in the frame flags (`LZ4` / `ZSTD`), so the receiver
//! never has to agree on it out of band.

use serde::{Deserialize, Serialize};
use std::io::Read;

use crate::core::frame::FrameFlags;
use crate::error::{ProtocolError, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    Lz4,
    Zstd,
}

impl CompressionKind {
    pub fn flag(self) -> FrameFlags {
        match self {
            CompressionKind::Lz4 => FrameFlags::LZ4,
            CompressionKind::Zstd => FrameFlags::ZSTD,
        }
    }

    /// Algorithm named by a frame's flags, if any. Both bits at once is malformed.
    pub fn from_flags(flags: FrameFlags) -> Result<Option<Self>> {
        match (
            flags.contains(FrameFlags::LZ4),
            flags.contains(FrameFlags::ZSTD),
        ) {
            (false, false) => Ok(None),
            (true, false) => Ok(Some(CompressionKind::Lz4)),
            (false, true) => Ok(Some(CompressionKind::Zstd)),
            (true, true) => Err(ProtocolError::InvalidHeader),
        }
    }
}

/// Below this many bits of entropy per byte, data is worth compressing
const MIN_ENTROPY_THRESHOLD: f64 = 4.0;

/// Shannon entropy in bits per byte (0.0 for uniform input, 8.0 for random)
fn calculate_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut freq = [0u32; 256];
    for &byte in data {
        freq[byte as usize] += 1;
    }

    let len = data.len() as f64;
    freq.iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

fn worth_compressing(data: &[u8], threshold_bytes: usize) -> bool {
    if data.len() < threshold_bytes {
        return false;
    }
    if data.len() < 1024 {
        return true;
    }
    let sample = &data[..data.len().min(512)];
    calculate_entropy(sample) < MIN_ENTROPY_THRESHOLD
}

pub fn compress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            zstd::stream::copy_encode(data, &mut out, 1)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            Ok(out)
        }
    }
}

/// Decompress, refusing to produce more than `max_output` bytes.
pub fn decompress(data: &[u8], kind: CompressionKind, max_output: usize) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => {
            if data.len() < 4 {
                return Err(ProtocolError::DecompressionFailure);
            }
            // lz4_flex prepends the decompressed size as u32 little-endian
            let claimed = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if claimed > max_output {
                return Err(ProtocolError::DecompressionFailure);
            }
            lz4_flex::decompress_size_prepended(data)
                .map_err(|_| ProtocolError::DecompressionFailure)
        }
        CompressionKind::Zstd => {
            let mut reader = zstd::stream::Decoder::new(data)
                .map_err(|_| ProtocolError::DecompressionFailure)?;
            let mut out = Vec::new();
            let mut buffer = [0u8; 8192];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        out.extend_from_slice(&buffer[..n]);
                        if out.len() > max_output {
                            return Err(ProtocolError::DecompressionFailure);
                        }
                    }
                    Err(_) => return Err(ProtocolError::DecompressionFailure),
                }
            }
            Ok(out)
        }
    }
}

/// Compress when the payload is large and low-entropy enough to benefit.
///
/// Returns the bytes to put on the wire and the flag to set, or `None` when the
/// payload is sent as-is.
pub fn compress_payload(
    data: &[u8],
    kind: CompressionKind,
    threshold_bytes: usize,
) -> Result<(Vec<u8>, Option<FrameFlags>)> {
    if !worth_compressing(data, threshold_bytes) {
        return Ok((data.to_vec(), None));
    }
    let compressed = compress(data, kind)?;
    if compressed.len() < data.len() {
        Ok((compressed, Some(kind.flag())))
    } else {
        Ok((data.to_vec(), None))
    }
}

/// Undo whatever compression the frame flags announce.
pub fn decompress_payload(data: &[u8], flags: FrameFlags, max_output: usize) -> Result<Vec<u8>> {
    match CompressionKind::from_flags(flags)? {
        Some(kind) => decompress(data, kind, max_output),
        None => Ok(data.to_vec()),
    }
}
