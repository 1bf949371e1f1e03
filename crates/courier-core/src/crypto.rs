//! Key agreement and authenticated encryption.
//!
//! - Key agreement: X25519 (ephemeral per session).
//! - Key derivation: `BLAKE2s-256(raw_shared_secret)`, always 32 bytes.
//! - AEAD: AES-256-GCM with a 12-byte caller-supplied nonce.

use crate::error::{CourierError, CourierResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use blake2::{Blake2s256, Digest};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of a raw X25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Length of the derived symmetric key.
pub const KEY_LEN: usize = 32;
/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;

/// An X25519 key pair.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair from the OS RNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Raw public key bytes.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        *self.public.as_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Symmetric session key derived from a handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Generate an ephemeral key pair.
pub fn generate_key_pair() -> KeyPair {
    KeyPair::generate()
}

/// Parse a raw public key received from a peer.
pub fn parse_public_key(bytes: &[u8]) -> CourierResult<PublicKey> {
    let raw: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
        CourierError::InvalidPeerKey(format!(
            "expected {PUBLIC_KEY_LEN} bytes, got {}",
            bytes.len()
        ))
    })?;
    Ok(PublicKey::from(raw))
}

/// X25519 between our private key and the peer's public key.
///
/// Rejects low-order peer points, which would force an all-zero secret.
pub fn derive_shared_secret(
    local: &KeyPair,
    peer_public: &[u8],
) -> CourierResult<[u8; PUBLIC_KEY_LEN]> {
    let peer = parse_public_key(peer_public)?;
    let shared = local.secret.diffie_hellman(&peer);
    if !shared.was_contributory() {
        return Err(CourierError::InvalidPeerKey("low-order point".into()));
    }
    Ok(shared.to_bytes())
}

/// Hash a raw shared secret down to a fixed-length AES-256 key.
pub fn hash_to_key(raw_secret: &[u8]) -> SessionKey {
    let digest = Blake2s256::digest(raw_secret);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest);
    SessionKey(key)
}

fn check_nonce(nonce: &[u8]) -> CourierResult<&Nonce<aes_gcm::aead::consts::U12>> {
    if nonce.len() != NONCE_LEN {
        return Err(CourierError::InvalidNonce {
            expected: NONCE_LEN,
            actual: nonce.len(),
        });
    }
    Ok(Nonce::from_slice(nonce))
}

fn cipher(key: &SessionKey) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0))
}

/// Seal `plaintext` under `key` and `nonce`. Output is ciphertext || tag.
pub fn encrypt(key: &SessionKey, nonce: &[u8], plaintext: &[u8]) -> CourierResult<Vec<u8>> {
    let nonce = check_nonce(nonce)?;
    cipher(key)
        .encrypt(nonce, plaintext)
        .map_err(|_| CourierError::Other("encryption failed".into()))
}

/// Open `ciphertext` sealed by [`encrypt`].
pub fn decrypt(key: &SessionKey, nonce: &[u8], ciphertext: &[u8]) -> CourierResult<Vec<u8>> {
    let nonce = check_nonce(nonce)?;
    cipher(key)
        .decrypt(nonce, ciphertext)
        .map_err(|_| CourierError::AuthenticationFailed)
}

/// Random nonce for callers that seal messages (clients, tests).
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}
