//! Per-connection secure channel.
//!
//! Owns the state machine `Unsecured → KeyExchanging → Secured → Closed` and the frame
//! transforms applied on each side of the wire:
//!
//! ```text
//! outbound: envelope → compress? → encrypt (Secured) → sign (Secured, sign_frames)
//! inbound:  verify → decrypt → decompress → envelope
//! ```
//!
//! Inbound checks never skip a frame: any integrity problem is reported as a
//! [`LostReason::Security`] and the connection is closed.

use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use std::sync::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::core::frame::{Frame, FrameFlags};
use crate::error::{constants, LostReason, ProtocolError, Result};
use crate::protocol::handshake::{self, InitiatorHandshake, SessionKeys};
use crate::protocol::message::{is_bootstrap, KeyExchangeAck, KeyExchangeInit};
use crate::utils::compression::{self, CompressionKind};
use crate::utils::crypto::Crypto;
use crate::utils::replay_cache::ReplayCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureState {
    Unsecured,
    KeyExchanging,
    Secured,
    Closed,
}

/// Settings for the frame transforms of one connection.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub secure: bool,
    pub sign_frames: bool,
    pub compression: Option<(CompressionKind, usize)>,
    pub max_payload: usize,
}

struct Session {
    crypto: Crypto,
    peer_verifying_key: VerifyingKey,
}

pub struct SecureChannel {
    options: ChannelOptions,
    signing_key: SigningKey,
    state: watch::Sender<SecureState>,
    session: RwLock<Option<Session>>,
    pending: Mutex<Option<InitiatorHandshake>>,
}

fn security(detail: impl Into<String>) -> LostReason {
    LostReason::Security(detail.into())
}

impl SecureChannel {
    pub fn new(options: ChannelOptions) -> Self {
        let initial = if options.secure {
            SecureState::KeyExchanging
        } else {
            SecureState::Unsecured
        };
        let (state, _) = watch::channel(initial);
        Self {
            options,
            signing_key: SigningKey::generate(&mut OsRng),
            state,
            session: RwLock::new(None),
            pending: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SecureState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SecureState> {
        self.state.subscribe()
    }

    pub fn is_enabled(&self) -> bool {
        self.options.secure
    }

    pub fn close(&self) {
        self.state.send_replace(SecureState::Closed);
        if let Ok(mut session) = self.session.write() {
            session.take();
        }
    }

    fn install(&self, keys: SessionKeys) -> Result<()> {
        let session = Session {
            crypto: Crypto::new(&keys.key),
            peer_verifying_key: keys.peer_verifying_key,
        };
        let mut slot = self
            .session
            .write()
            .map_err(|_| ProtocolError::SecurityError(constants::ERR_HANDSHAKE_FAILED.into()))?;
        *slot = Some(session);
        Ok(())
    }

    /// Initiator: build the key-exchange request and remember the ephemeral secret.
    pub fn begin_key_exchange(&self) -> Result<KeyExchangeInit> {
        if self.state() != SecureState::KeyExchanging {
            return Err(ProtocolError::SecurityError(constants::ERR_HANDSHAKE_FAILED.into()));
        }
        let (state, init) = InitiatorHandshake::start(&self.signing_key.verifying_key())?;
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| ProtocolError::SecurityError(constants::ERR_HANDSHAKE_FAILED.into()))?;
        *pending = Some(state);
        Ok(init)
    }

    /// Initiator: check the ack and switch to `Secured`.
    ///
    /// Runs on the read loop before the next frame is read, so the responder's first
    /// encrypted frame always finds the session key in place.
    pub fn finish_key_exchange(&self, ack: &KeyExchangeAck) -> Result<()> {
        let state = self
            .pending
            .lock()
            .ok()
            .and_then(|mut p| p.take())
            .ok_or(ProtocolError::UnexpectedMessage)?;
        let keys = state.finish(ack)?;
        self.install(keys)?;
        self.state.send_replace(SecureState::Secured);
        debug!("Secure channel established (initiator)");
        Ok(())
    }

    /// Responder: validate the request and derive the session.
    ///
    /// The state stays `KeyExchanging` until [`mark_secured`](Self::mark_secured), so
    /// the ack itself still goes out in the clear.
    pub fn accept_key_exchange(
        &self,
        init: &KeyExchangeInit,
        peer: &str,
        replay_cache: &Mutex<ReplayCache>,
    ) -> Result<KeyExchangeAck> {
        if self.state() != SecureState::KeyExchanging {
            return Err(ProtocolError::SecurityError(constants::ERR_HANDSHAKE_FAILED.into()));
        }
        let (keys, ack) = {
            let mut cache = replay_cache
                .lock()
                .map_err(|_| ProtocolError::SecurityError(constants::ERR_HANDSHAKE_FAILED.into()))?;
            handshake::respond(init, &self.signing_key.verifying_key(), peer, &mut cache)?
        };
        self.install(keys)?;
        Ok(ack)
    }

    pub fn mark_secured(&self) {
        self.state.send_replace(SecureState::Secured);
        debug!("Secure channel established (responder)");
    }

    /// Apply outbound transforms to an envelope and frame it.
    pub fn seal(&self, type_id: u16, envelope: Bytes) -> Result<Frame> {
        let state = self.state();
        match state {
            SecureState::Closed => return Err(ProtocolError::ConnectionClosed),
            SecureState::KeyExchanging if !is_bootstrap(type_id) => {
                return Err(ProtocolError::SecurityError(constants::ERR_NOT_BOOTSTRAP.into()))
            }
            _ => {}
        }

        let mut flags = FrameFlags::empty();
        let mut payload = match self.options.compression {
            Some((kind, threshold)) => {
                let (bytes, flag) = compression::compress_payload(&envelope, kind, threshold)?;
                if let Some(flag) = flag {
                    flags |= flag;
                }
                bytes
            }
            None => envelope.to_vec(),
        };

        let mut signature = None;
        if state == SecureState::Secured {
            let session = self
                .session
                .read()
                .map_err(|_| ProtocolError::EncryptionFailure)?;
            let session = session.as_ref().ok_or(ProtocolError::EncryptionFailure)?;
            payload = session.crypto.seal(&payload)?;
            flags |= FrameFlags::ENCRYPTED;
            if self.options.sign_frames {
                flags |= FrameFlags::SIGNED;
                let signed = Frame::signed_bytes(type_id, flags, &payload);
                signature = Some(self.signing_key.sign(&signed).to_bytes());
            }
        }

        if payload.len() > self.options.max_payload {
            return Err(ProtocolError::OversizedPacket(payload.len()));
        }
        Ok(Frame {
            type_id,
            flags,
            payload: Bytes::from(payload),
            signature,
        })
    }

    /// Check and undo the transforms of an inbound frame.
    ///
    /// `Err` means the connection must close with the returned reason.
    pub fn open(&self, frame: Frame) -> std::result::Result<Bytes, LostReason> {
        let encrypted = frame.flags.contains(FrameFlags::ENCRYPTED);
        let signed = frame.flags.contains(FrameFlags::SIGNED);

        let plaintext = match self.state() {
            SecureState::Closed => return Err(LostReason::ClosedLocally),
            SecureState::Unsecured => {
                if encrypted || signed {
                    return Err(security(constants::ERR_ENCRYPTED_WHEN_INSECURE));
                }
                frame.payload
            }
            SecureState::KeyExchanging => {
                if encrypted || signed {
                    return Err(security(constants::ERR_ENCRYPTED_WHEN_INSECURE));
                }
                if !is_bootstrap(frame.type_id) {
                    return Err(security(constants::ERR_NOT_BOOTSTRAP));
                }
                frame.payload
            }
            SecureState::Secured => {
                if !encrypted {
                    return Err(security(constants::ERR_PLAINTEXT_WHEN_SECURED));
                }
                let session = self
                    .session
                    .read()
                    .map_err(|_| security(constants::ERR_DECRYPTION_FAILED))?;
                let session = session
                    .as_ref()
                    .ok_or_else(|| security(constants::ERR_DECRYPTION_FAILED))?;

                match (&frame.signature, self.options.sign_frames) {
                    (Some(sig), _) => {
                        let signed_bytes =
                            Frame::signed_bytes(frame.type_id, frame.flags, &frame.payload);
                        if session
                            .peer_verifying_key
                            .verify(&signed_bytes, &Signature::from_bytes(sig))
                            .is_err()
                        {
                            warn!(type_id = frame.type_id, "Frame signature rejected");
                            return Err(security(constants::ERR_SIGNATURE_INVALID));
                        }
                    }
                    (None, true) => return Err(security(constants::ERR_SIGNATURE_MISSING)),
                    (None, false) => {}
                }

                match session.crypto.open(&frame.payload) {
                    Ok(plain) => Bytes::from(plain),
                    Err(_) => {
                        warn!(type_id = frame.type_id, "Frame decryption failed");
                        return Err(security(constants::ERR_DECRYPTION_FAILED));
                    }
                }
            }
        };

        if !frame.flags.intersects(FrameFlags::LZ4 | FrameFlags::ZSTD) {
            return Ok(plaintext);
        }
        compression::decompress_payload(&plaintext, frame.flags, self.options.max_payload)
            .map(Bytes::from)
            .map_err(|e| LostReason::Protocol(e.to_string()))
    }
}
