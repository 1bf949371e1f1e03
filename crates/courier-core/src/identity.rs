//! Connection identifiers and short key fingerprints for logs.

use blake2::{Blake2s256, Digest};
use rand::Rng;

/// Generate a random connection ID (hex-encoded, 16 bytes = 32 hex chars).
pub fn generate_connection_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

/// Short hex fingerprint of a raw public key, safe to log.
pub fn key_fingerprint(public_key: &[u8]) -> String {
    let hash = Blake2s256::digest(public_key);
    hex::encode(&hash[..8])
}
