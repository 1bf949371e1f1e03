//! courier-core: Shared protocol library for the courier gateway.
//!
//! Provides the JSON wire envelope and application message types, the
//! base64/JSON codec, X25519 key agreement, BLAKE2s key derivation and
//! AES-256-GCM sealing used by the handshake and message protocol.

pub mod codec;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_frame, encode_ack, encode_message, b64_decode, b64_encode};
pub use crypto::{KeyPair, SessionKey, NONCE_LEN, KEY_LEN};
pub use error::{CourierError, CourierResult};
pub use identity::{generate_connection_id, key_fingerprint};
pub use messages::{ApplicationMessage, Frame, HandshakeAck, ReceiverKind};
