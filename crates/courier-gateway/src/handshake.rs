//! Handshake and encrypted-message protocol.
//!
//! Turns one raw inbound frame into an outcome for the connection task:
//! 1. `Handshake` → derive the session key, reply with `HandshakeAck`
//! 2. `MessagePkg` before the handshake → dropped with a warning
//! 3. `MessagePkg` after the handshake → decrypt into an [`ApplicationMessage`]
//! 4. Any other tag → dropped with a warning
//!
//! Errors are frame-local: the caller logs them and keeps the connection.
//! A failed message step never mutates the session.

use crate::session::Session;
use courier_core::crypto::{self, NONCE_LEN};
use courier_core::messages::{ApplicationMessage, Frame, HandshakeAck, MESSAGE_TYPE};
use courier_core::{codec, key_fingerprint, CourierError, CourierResult};
use tracing::{debug, info, warn};

/// What the connection task should do with a processed frame.
#[derive(Debug)]
pub enum FrameOutcome {
    /// Handshake completed; send the ack back to the client.
    Handshake(HandshakeAck),
    /// Decrypted message ready for dispatch.
    Message(ApplicationMessage),
    /// Frame discarded without a reply.
    Dropped(DropReason),
}

/// Why a well-formed frame was discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Encrypted message arrived before any handshake.
    HandshakeRequired,
    /// Frame tag this gateway does not understand.
    UnknownKind(String),
}

/// Process one inbound frame against the session.
pub fn process_frame(session: &mut Session, data: &[u8]) -> CourierResult<FrameOutcome> {
    let frame = codec::decode_frame(data)?;
    debug!(connection_id = %session.connection_id(), kind = %frame.kind(), "inbound frame");

    match frame {
        Frame::Handshake { public_key } => {
            handle_handshake(session, &public_key).map(FrameOutcome::Handshake)
        }
        Frame::EncryptedMessage { ciphertext, nonce } => {
            if !session.handshake_complete() {
                warn!(
                    connection_id = %session.connection_id(),
                    "handshake not done, ignoring {MESSAGE_TYPE}"
                );
                return Ok(FrameOutcome::Dropped(DropReason::HandshakeRequired));
            }
            let nonce = nonce.ok_or_else(|| {
                CourierError::InvalidMessage(format!("{MESSAGE_TYPE} without iv"))
            })?;
            handle_encrypted_message(session, &ciphertext, &nonce).map(FrameOutcome::Message)
        }
        Frame::Unknown { kind } => {
            warn!(connection_id = %session.connection_id(), kind = %kind, "unknown frame type");
            Ok(FrameOutcome::Dropped(DropReason::UnknownKind(kind)))
        }
    }
}

/// Run the key agreement for a `Handshake` frame.
///
/// The local key pair is generated on the first handshake and reused by
/// later ones; the shared key is recomputed every time so a peer may present
/// a new public key on the same connection.
pub fn handle_handshake(session: &mut Session, public_key_b64: &str) -> CourierResult<HandshakeAck> {
    let peer_public = codec::b64_decode(public_key_b64)
        .map_err(|e| CourierError::InvalidPeerKey(e.to_string()))?;
    crypto::parse_public_key(&peer_public)?;

    let local = session.key_pair_or_generate();
    let raw = crypto::derive_shared_secret(local, &peer_public)?;
    let server_public = local.public_bytes();

    session.install_key(crypto::hash_to_key(&raw));

    info!(
        connection_id = %session.connection_id(),
        peer = %key_fingerprint(&peer_public),
        "handshake done"
    );

    Ok(HandshakeAck::new(codec::b64_encode(&server_public)))
}

/// Decrypt and decode a `MessagePkg` frame in a ready session.
pub fn handle_encrypted_message(
    session: &mut Session,
    ciphertext_b64: &str,
    nonce_b64: &str,
) -> CourierResult<ApplicationMessage> {
    let key = session
        .shared_key()
        .ok_or_else(|| CourierError::HandshakeRequired(MESSAGE_TYPE.to_string()))?;

    let nonce_bytes = codec::b64_decode(nonce_b64)?;
    let nonce: [u8; NONCE_LEN] =
        nonce_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CourierError::InvalidNonce {
                expected: NONCE_LEN,
                actual: nonce_bytes.len(),
            })?;
    if session.nonce_seen(&nonce) {
        return Err(CourierError::NonceReused);
    }
    if session.rekey_required() {
        warn!(
            connection_id = %session.connection_id(),
            accepted = session.nonces_recorded(),
            "message allowance for this key used up, waiting for a new handshake"
        );
        return Err(CourierError::RekeyRequired(session.nonce_limit()));
    }

    let ciphertext = codec::b64_decode(ciphertext_b64)?;
    let plaintext = crypto::decrypt(key, &nonce, &ciphertext)?;
    let msg = codec::decode_message(&plaintext)?;

    session.record_nonce(nonce);
    Ok(msg)
}
