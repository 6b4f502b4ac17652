//! Key exchange using Elliptic Curve Diffie-Hellman (X25519).
//!
//! One request/response pair establishes the session:
//!
//! 1. The initiator sends its ephemeral X25519 public key, its Ed25519 verifying key,
//!    the key size, a random nonce and a timestamp.
//! 2. The responder checks the timestamp window and the replay cache, answers with its
//!    own keys, nonce and `SHA-256(initiator nonce)`, and derives the session key.
//! 3. The initiator checks the nonce hash and derives the same key.
//!
//! Session key: `SHA-256(shared ‖ "client_nonce" ‖ cn ‖ "server_nonce" ‖ sn)`.
//!
//! State is per handshake, never global, so concurrent handshakes cannot trample each
//! other.

use ed25519_dalek::VerifyingKey;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};
use zeroize::Zeroize;

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{KeyExchangeAck, KeyExchangeInit};
use crate::utils::replay_cache::ReplayCache;

/// Session key size announced in the exchange
pub const KEY_SIZE_BITS: u16 = 256;

/// Oldest acceptable initiator timestamp, in seconds
pub const MAX_TIMESTAMP_AGE_SECS: u64 = 30;

const FUTURE_TOLERANCE_MS: u64 = 2000;

/// Keys agreed by a completed exchange.
pub struct SessionKeys {
    pub key: [u8; 32],
    pub peer_verifying_key: VerifyingKey,
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Initiator state between sending the request and reading the ack.
pub struct InitiatorHandshake {
    // zeroized by its own Drop
    secret: Option<EphemeralSecret>,
    nonce: [u8; 16],
}

impl Drop for InitiatorHandshake {
    fn drop(&mut self) {
        self.nonce.zeroize();
    }
}

fn current_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|_| ProtocolError::Custom(constants::ERR_SYSTEM_TIME.into()))
}

fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Accept timestamps up to `max_age_seconds` old and at most 2 s in the future.
pub fn verify_timestamp(timestamp: u64, max_age_seconds: u64) -> bool {
    let Ok(now) = current_timestamp() else {
        return false;
    };
    if timestamp > now + FUTURE_TOLERANCE_MS {
        return false;
    }
    now.saturating_sub(timestamp) <= max_age_seconds * 1000
}

fn hash_nonce(nonce: &[u8]) -> [u8; 32] {
    Sha256::digest(nonce).into()
}

fn derive_session_key(shared: &SharedSecret, client_nonce: &[u8], server_nonce: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared.as_bytes());
    hasher.update(b"client_nonce");
    hasher.update(client_nonce);
    hasher.update(b"server_nonce");
    hasher.update(server_nonce);
    hasher.finalize().into()
}

fn parse_verifying_key(bytes: &[u8; 32]) -> Result<VerifyingKey> {
    VerifyingKey::from_bytes(bytes)
        .map_err(|_| ProtocolError::HandshakeError(constants::ERR_INVALID_VERIFYING_KEY.into()))
}

fn check_key_size(key_size: u16) -> Result<()> {
    if key_size == KEY_SIZE_BITS {
        Ok(())
    } else {
        Err(ProtocolError::HandshakeError(format!(
            "{}: {key_size}",
            constants::ERR_KEY_SIZE_MISMATCH
        )))
    }
}

impl InitiatorHandshake {
    #[instrument(skip(verifying_key))]
    pub fn start(verifying_key: &VerifyingKey) -> Result<(Self, KeyExchangeInit)> {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let nonce = generate_nonce();

        let init = KeyExchangeInit {
            public_key: public.to_bytes(),
            verifying_key: verifying_key.to_bytes(),
            key_size: KEY_SIZE_BITS,
            nonce,
            timestamp: current_timestamp()?,
        };
        debug!("Initiating key exchange");
        Ok((
            Self {
                secret: Some(secret),
                nonce,
            },
            init,
        ))
    }

    /// Check the responder's ack and derive the session key.
    #[instrument(skip(self, ack))]
    pub fn finish(mut self, ack: &KeyExchangeAck) -> Result<SessionKeys> {
        check_key_size(ack.key_size)?;
        if hash_nonce(&self.nonce) != ack.nonce_verification {
            return Err(ProtocolError::HandshakeError(
                constants::ERR_NONCE_VERIFICATION_FAILED.into(),
            ));
        }
        let peer_verifying_key = parse_verifying_key(&ack.verifying_key)?;
        let secret = self
            .secret
            .take()
            .ok_or_else(|| ProtocolError::HandshakeError(constants::ERR_HANDSHAKE_FAILED.into()))?;

        let shared = secret.diffie_hellman(&PublicKey::from(ack.public_key));
        let key = derive_session_key(&shared, &self.nonce, &ack.nonce);
        debug!("Initiator derived session key");
        Ok(SessionKeys {
            key,
            peer_verifying_key,
        })
    }

    #[cfg(test)]
    pub(crate) fn nonce(&self) -> &[u8; 16] {
        &self.nonce
    }
}

/// Validate the initiator's request, produce the ack and derive the session key.
#[instrument(skip(init, verifying_key, replay_cache))]
pub fn respond(
    init: &KeyExchangeInit,
    verifying_key: &VerifyingKey,
    peer: &str,
    replay_cache: &mut ReplayCache,
) -> Result<(SessionKeys, KeyExchangeAck)> {
    check_key_size(init.key_size)?;
    if !verify_timestamp(init.timestamp, MAX_TIMESTAMP_AGE_SECS) {
        return Err(ProtocolError::HandshakeError(
            constants::ERR_INVALID_TIMESTAMP.into(),
        ));
    }
    if replay_cache.check_and_insert(peer, &init.nonce) {
        return Err(ProtocolError::HandshakeError(
            constants::ERR_REPLAY_ATTACK.into(),
        ));
    }
    let peer_verifying_key = parse_verifying_key(&init.verifying_key)?;

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    let nonce = generate_nonce();
    let shared = secret.diffie_hellman(&PublicKey::from(init.public_key));
    let key = derive_session_key(&shared, &init.nonce, &nonce);

    let ack = KeyExchangeAck {
        public_key: public.to_bytes(),
        verifying_key: verifying_key.to_bytes(),
        key_size: KEY_SIZE_BITS,
        nonce,
        nonce_verification: hash_nonce(&init.nonce),
    };
    debug!("Responder derived session key");
    Ok((
        SessionKeys {
            key,
            peer_verifying_key,
        },
        ack,
    ))
}
