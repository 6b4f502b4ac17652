#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_link::utils::compression::{decompress, CompressionKind};

const MAX_OUTPUT: usize = 1024 * 1024;

fuzz_target!(|data: &[u8]| {
    for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
        if let Ok(out) = decompress(data, kind, MAX_OUTPUT) {
            assert!(out.len() <= MAX_OUTPUT);
        }
    }
});
