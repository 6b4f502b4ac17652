//! # Utility Modules
//!
//! Supporting utilities for cryptography, compression, logging, and timing.
//!
//! ## Components
//! - **Crypto**: XChaCha20-Poly1305 AEAD for secured frames
//! - **Compression**: LZ4 and Zstd with output limits and an entropy check
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Timeout defaults and async wrappers
//! - **Replay Cache**: TTL-based nonce deduplication for key exchange
//! - **Metrics**: Per-container atomic counters
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom)
//! - Decompression bomb protection
//! - Memory zeroing for key material (zeroize crate)

pub mod compression;
pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod replay_cache;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};
pub use replay_cache::ReplayCache;
