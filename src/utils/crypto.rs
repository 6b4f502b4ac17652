//! Authenticated encryption for secured frames.
//!
//! XChaCha20-Poly1305 with a fresh random 24-byte nonce per frame. The nonce is
//! prepended to the ciphertext, so an encrypted payload is `nonce(24) | ciphertext`.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use zeroize::Zeroize;

use crate::error::{ProtocolError, Result};

pub const NONCE_LEN: usize = 24;
pub const KEY_LEN: usize = 32;

pub struct Crypto {
    cipher: XChaCha20Poly1305,
}

impl Crypto {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.into()),
        }
    }

    /// Fill a buffer from the OS RNG.
    pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        getrandom::fill(&mut buf)
            .map_err(|e| ProtocolError::Custom(format!("OS random source failed: {e}")))?;
        Ok(buf)
    }

    pub fn generate_nonce() -> Result<[u8; NONCE_LEN]> {
        Self::random_bytes::<NONCE_LEN>()
    }

    /// Encrypt and return `nonce | ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = Self::generate_nonce()?;
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| ProtocolError::EncryptionFailure)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        nonce.zeroize();
        Ok(out)
    }

    /// Split off the nonce and decrypt. Any tampering yields `DecryptionFailure`.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}

impl std::fmt::Debug for Crypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Crypto(..)")
    }
}
