//! Per-connection session state.
//!
//! A session is owned by exactly one connection task, so nothing here is
//! locked. The shared key is held as an `Option`: the handshake is complete
//! exactly when a key is present.
//!
//! Nonce history is bounded: once `nonce_limit` messages have been accepted
//! under one key, further messages are refused until the client performs a
//! new handshake.

use courier_core::crypto::{KeyPair, SessionKey, NONCE_LEN};
use std::collections::HashSet;

/// Messages accepted under one session key before a new handshake is required.
pub const DEFAULT_NONCE_LIMIT: usize = 4096;

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Ready,
}

/// Negotiated state for one client connection.
#[derive(Debug)]
pub struct Session {
    connection_id: String,
    local_key_pair: Option<KeyPair>,
    shared_key: Option<SessionKey>,
    /// Nonces accepted under the current `shared_key`.
    seen_nonces: HashSet<[u8; NONCE_LEN]>,
    nonce_limit: usize,
}

impl Session {
    #[cfg(test)]
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self::with_nonce_limit(connection_id, DEFAULT_NONCE_LIMIT)
    }

    /// Session that accepts at most `nonce_limit` messages per key.
    pub fn with_nonce_limit(connection_id: impl Into<String>, nonce_limit: usize) -> Self {
        Self {
            connection_id: connection_id.into(),
            local_key_pair: None,
            shared_key: None,
            seen_nonces: HashSet::new(),
            nonce_limit: nonce_limit.max(1),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> SessionState {
        if self.shared_key.is_some() {
            SessionState::Ready
        } else {
            SessionState::AwaitingHandshake
        }
    }

    pub fn handshake_complete(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn shared_key(&self) -> Option<&SessionKey> {
        self.shared_key.as_ref()
    }

    #[cfg(test)]
    pub fn local_key_pair(&self) -> Option<&KeyPair> {
        self.local_key_pair.as_ref()
    }

    /// The session's key pair, generated on first use and kept afterwards.
    pub(crate) fn key_pair_or_generate(&mut self) -> &KeyPair {
        self.local_key_pair.get_or_insert_with(KeyPair::generate)
    }

    /// Install a freshly derived key. Nonce history belongs to the old key
    /// and is discarded.
    pub(crate) fn install_key(&mut self, key: SessionKey) {
        self.shared_key = Some(key);
        self.seen_nonces.clear();
    }

    pub(crate) fn nonce_seen(&self, nonce: &[u8; NONCE_LEN]) -> bool {
        self.seen_nonces.contains(nonce)
    }

    /// Whether the current key has used up its message allowance.
    pub(crate) fn rekey_required(&self) -> bool {
        self.seen_nonces.len() >= self.nonce_limit
    }

    pub(crate) fn record_nonce(&mut self, nonce: [u8; NONCE_LEN]) {
        if !self.rekey_required() {
            self.seen_nonces.insert(nonce);
        }
    }

    /// Number of nonces accepted under the current key.
    pub fn nonces_recorded(&self) -> usize {
        self.seen_nonces.len()
    }

    pub fn nonce_limit(&self) -> usize {
        self.nonce_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_awaits_handshake() {
        let s = Session::new("c1");
        assert_eq!(s.connection_id(), "c1");
        assert_eq!(s.state(), SessionState::AwaitingHandshake);
        assert!(!s.handshake_complete());
        assert!(s.shared_key().is_none());
        assert!(s.local_key_pair().is_none());
    }

    #[test]
    fn key_pair_generated_once() {
        let mut s = Session::new("c1");
        let first = s.key_pair_or_generate().public_bytes();
        let second = s.key_pair_or_generate().public_bytes();
        assert_eq!(first, second);
    }

    #[test]
    fn installing_key_marks_ready_and_resets_nonces() {
        let mut s = Session::new("c1");
        s.install_key(SessionKey::from_bytes([1; 32]));
        assert!(s.handshake_complete());

        s.record_nonce([9; NONCE_LEN]);
        assert!(s.nonce_seen(&[9; NONCE_LEN]));

        s.install_key(SessionKey::from_bytes([2; 32]));
        assert!(!s.nonce_seen(&[9; NONCE_LEN]));
        assert_eq!(s.nonces_recorded(), 0);
    }

    #[test]
    fn nonce_history_stops_at_limit_until_rekey() {
        let mut s = Session::with_nonce_limit("c1", 3);
        s.install_key(SessionKey::from_bytes([1; 32]));
        for i in 0..10u8 {
            s.record_nonce([i; NONCE_LEN]);
        }
        assert_eq!(s.nonces_recorded(), 3);
        assert!(s.rekey_required());

        s.install_key(SessionKey::from_bytes([2; 32]));
        assert!(!s.rekey_required());
        assert_eq!(s.nonces_recorded(), 0);
    }

    #[test]
    fn zero_limit_is_raised_to_one() {
        assert_eq!(Session::with_nonce_limit("c1", 0).nonce_limit(), 1);
        assert_eq!(Session::new("c1").nonce_limit(), DEFAULT_NONCE_LIMIT);
    }
}
