//! Wire types for the courier gateway protocol.
//!
//! Inbound frames are JSON envelopes `{ "type", "pkg", "iv"? }`. The `type`
//! tag is an open string on the wire; [`Frame`] closes it into the variants
//! the gateway understands and keeps an explicit [`Frame::Unknown`] arm for
//! forward compatibility.

use serde::{Deserialize, Serialize};

/// Wire tag of the key-exchange frame.
pub const HANDSHAKE_TYPE: &str = "Handshake";
/// Wire tag of an encrypted application message frame.
pub const MESSAGE_TYPE: &str = "MessagePkg";
/// Wire tag of the server's handshake acknowledgement.
pub const HANDSHAKE_ACK_TYPE: &str = "HandshakeAck";

/// Raw JSON envelope as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub pkg: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
}

/// A decoded inbound frame. Payload fields stay in their base64 wire form;
/// the protocol step that consumes them does the decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client public key, base64 of the raw 32 key bytes.
    Handshake { public_key: String },
    /// Base64 ciphertext plus the base64 nonce from `iv` (required, but
    /// validated by the message step rather than the decoder).
    EncryptedMessage {
        ciphertext: String,
        nonce: Option<String>,
    },
    /// Any tag this gateway does not understand.
    Unknown { kind: String },
}

impl Frame {
    /// The wire tag, for logging.
    pub fn kind(&self) -> &str {
        match self {
            Frame::Handshake { .. } => HANDSHAKE_TYPE,
            Frame::EncryptedMessage { .. } => MESSAGE_TYPE,
            Frame::Unknown { kind } => kind,
        }
    }
}

/// Acknowledgement sent back after a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    #[serde(rename = "type")]
    pub kind: String,
    pub msg: String,
    #[serde(rename = "serverPubKey")]
    pub server_pub_key: String,
}

impl HandshakeAck {
    /// Build an ack carrying the server's base64 public key.
    pub fn new(server_pub_key: String) -> Self {
        Self {
            kind: HANDSHAKE_ACK_TYPE.to_string(),
            msg: "Handshake successful".to_string(),
            server_pub_key,
        }
    }
}

/// Who a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReceiverKind {
    Direct,
    Group,
    Broadcast,
    /// Unrecognised wire value, kept verbatim.
    Other(String),
}

impl From<String> for ReceiverKind {
    fn from(raw: String) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "dm" | "direct" => ReceiverKind::Direct,
            "group" => ReceiverKind::Group,
            "broadcast" => ReceiverKind::Broadcast,
            _ => ReceiverKind::Other(raw),
        }
    }
}

impl From<ReceiverKind> for String {
    fn from(kind: ReceiverKind) -> String {
        match kind {
            ReceiverKind::Direct => "DM".to_string(),
            ReceiverKind::Group => "GROUP".to_string(),
            ReceiverKind::Broadcast => "BROADCAST".to_string(),
            ReceiverKind::Other(raw) => raw,
        }
    }
}

impl std::fmt::Display for ReceiverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiverKind::Direct => f.write_str("DM"),
            ReceiverKind::Group => f.write_str("GROUP"),
            ReceiverKind::Broadcast => f.write_str("BROADCAST"),
            ReceiverKind::Other(raw) => f.write_str(raw),
        }
    }
}

/// Decrypted application payload of a `MessagePkg` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationMessage {
    pub content: String,
    pub timestamp: String,
    #[serde(rename = "senderID")]
    pub sender_id: String,
    #[serde(rename = "messageType")]
    pub receiver_kind: ReceiverKind,
    #[serde(rename = "receiverID")]
    pub receiver_id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receiver_kind_aliases() {
        assert_eq!(ReceiverKind::from("DM".to_string()), ReceiverKind::Direct);
        assert_eq!(ReceiverKind::from("direct".to_string()), ReceiverKind::Direct);
        assert_eq!(ReceiverKind::from("Group".to_string()), ReceiverKind::Group);
        assert_eq!(
            ReceiverKind::from("BROADCAST".to_string()),
            ReceiverKind::Broadcast
        );
        assert_eq!(
            ReceiverKind::from("channel".to_string()),
            ReceiverKind::Other("channel".into())
        );
    }

    #[test]
    fn application_message_uses_wire_field_names() {
        let json = r#"{"content":"hi","timestamp":"t1","senderID":"u1","messageType":"DM","receiverID":"u2","messageID":"m1"}"#;
        let msg: ApplicationMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.sender_id, "u1");
        assert_eq!(msg.receiver_kind, ReceiverKind::Direct);
        assert_eq!(msg.message_id, "m1");

        let back = serde_json::to_value(&msg).unwrap();
        assert_eq!(back["messageType"], "DM");
        assert_eq!(back["receiverID"], "u2");
    }

    #[test]
    fn ack_wire_shape() {
        let ack = HandshakeAck::new("AAAA".into());
        let v = serde_json::to_value(&ack).unwrap();
        assert_eq!(v["type"], "HandshakeAck");
        assert_eq!(v["serverPubKey"], "AAAA");
        assert_eq!(v["msg"], "Handshake successful");
    }
}
