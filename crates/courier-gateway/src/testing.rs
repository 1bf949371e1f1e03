//! Test helpers: a client-side protocol driver and an in-memory publisher.

use crate::bridge::Publisher;
use courier_core::crypto::{self, KeyPair, SessionKey, NONCE_LEN};
use courier_core::messages::{ApplicationMessage, Frame, HandshakeAck, ReceiverKind};
use courier_core::{codec, CourierError, CourierResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Client half of the protocol.
pub struct TestClient {
    key_pair: KeyPair,
    key: Option<SessionKey>,
}

impl TestClient {
    pub fn new() -> Self {
        Self {
            key_pair: KeyPair::generate(),
            key: None,
        }
    }

    pub fn key(&self) -> Option<&SessionKey> {
        self.key.as_ref()
    }

    pub fn force_key(&mut self, key: [u8; 32]) {
        self.key = Some(SessionKey::from_bytes(key));
    }

    pub fn handshake_frame(&self) -> String {
        codec::encode_frame(&Frame::Handshake {
            public_key: codec::b64_encode(&self.key_pair.public_bytes()),
        })
        .unwrap()
    }

    pub fn complete(&mut self, ack: &HandshakeAck) {
        let server_pub = codec::b64_decode(&ack.server_pub_key).unwrap();
        let raw = crypto::derive_shared_secret(&self.key_pair, &server_pub).unwrap();
        self.key = Some(crypto::hash_to_key(&raw));
    }

    pub fn complete_from_json(&mut self, text: &str) {
        let ack: HandshakeAck = serde_json::from_str(text).unwrap();
        self.complete(&ack);
    }

    pub fn seal(&self, msg: &ApplicationMessage) -> String {
        self.seal_with_nonce(msg, crypto::random_nonce())
    }

    pub fn seal_with_nonce(&self, msg: &ApplicationMessage, nonce: [u8; NONCE_LEN]) -> String {
        let plaintext = codec::encode_message(msg).unwrap();
        self.frame(&self.encrypt(&plaintext, nonce), nonce)
    }

    pub fn seal_tampered(&self, msg: &ApplicationMessage, nonce: [u8; NONCE_LEN]) -> String {
        let plaintext = codec::encode_message(msg).unwrap();
        let mut ct = self.encrypt(&plaintext, nonce);
        ct[0] ^= 0x01;
        self.frame(&ct, nonce)
    }

    pub fn seal_raw(&self, plaintext: &[u8]) -> String {
        let nonce = crypto::random_nonce();
        self.frame(&self.encrypt(plaintext, nonce), nonce)
    }

    fn encrypt(&self, plaintext: &[u8], nonce: [u8; NONCE_LEN]) -> Vec<u8> {
        let key = self.key.as_ref().expect("client has no key");
        crypto::encrypt(key, &nonce, plaintext).unwrap()
    }

    fn frame(&self, ciphertext: &[u8], nonce: [u8; NONCE_LEN]) -> String {
        codec::encode_frame(&Frame::EncryptedMessage {
            ciphertext: codec::b64_encode(ciphertext),
            nonce: Some(codec::b64_encode(&nonce)),
        })
        .unwrap()
    }
}

pub fn sample_message(id: &str) -> ApplicationMessage {
    ApplicationMessage {
        content: "hi".into(),
        timestamp: "t1".into(),
        sender_id: "u1".into(),
        receiver_kind: ReceiverKind::Direct,
        receiver_id: "u2".into(),
        message_id: id.into(),
    }
}

/// Publisher that records every publish in order.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, String)>>,
    fail: AtomicBool,
    closed: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let p = Self::default();
        p.fail.store(true, Ordering::SeqCst);
        p
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Publisher for RecordingPublisher {
    async fn publish(&self, channel: &str, payload: String) -> CourierResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CourierError::Broker("publish rejected".into()));
        }
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), payload));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
