//! JSON envelope codec for the courier wire protocol.
//!
//! Binary fields (public keys, nonces, ciphertext) travel as standard
//! padded base64 strings.

use crate::error::{CourierError, CourierResult};
use crate::messages::{
    ApplicationMessage, Frame, HandshakeAck, WireEnvelope, HANDSHAKE_TYPE, MESSAGE_TYPE,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Encode bytes as standard base64.
pub fn b64_encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode standard base64.
pub fn b64_decode(data: &str) -> CourierResult<Vec<u8>> {
    Ok(BASE64.decode(data)?)
}

/// Decode one inbound frame.
///
/// Fails only when the bytes are not a JSON envelope or a known tag carries
/// a `pkg` of the wrong JSON type. Unknown tags decode to [`Frame::Unknown`].
pub fn decode_frame(data: &[u8]) -> CourierResult<Frame> {
    let envelope: WireEnvelope = serde_json::from_slice(data)?;

    match envelope.kind.as_str() {
        HANDSHAKE_TYPE => Ok(Frame::Handshake {
            public_key: pkg_string(envelope.pkg, HANDSHAKE_TYPE)?,
        }),
        MESSAGE_TYPE => Ok(Frame::EncryptedMessage {
            ciphertext: pkg_string(envelope.pkg, MESSAGE_TYPE)?,
            nonce: envelope.iv,
        }),
        _ => Ok(Frame::Unknown {
            kind: envelope.kind,
        }),
    }
}

fn pkg_string(pkg: serde_json::Value, kind: &str) -> CourierResult<String> {
    match pkg {
        serde_json::Value::String(s) => Ok(s),
        other => Err(CourierError::InvalidMessage(format!(
            "{kind} pkg must be a base64 string, got {}",
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Encode an inbound-style frame. Used by clients and tests.
pub fn encode_frame(frame: &Frame) -> CourierResult<String> {
    let envelope = match frame {
        Frame::Handshake { public_key } => WireEnvelope {
            kind: HANDSHAKE_TYPE.to_string(),
            pkg: serde_json::Value::String(public_key.clone()),
            iv: None,
        },
        Frame::EncryptedMessage { ciphertext, nonce } => WireEnvelope {
            kind: MESSAGE_TYPE.to_string(),
            pkg: serde_json::Value::String(ciphertext.clone()),
            iv: nonce.clone(),
        },
        Frame::Unknown { kind } => WireEnvelope {
            kind: kind.clone(),
            pkg: serde_json::Value::Null,
            iv: None,
        },
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Encode the handshake acknowledgement as a JSON text frame.
pub fn encode_ack(ack: &HandshakeAck) -> CourierResult<String> {
    Ok(serde_json::to_string(ack)?)
}

/// Serialize an application message into the plaintext that gets sealed.
pub fn encode_message(msg: &ApplicationMessage) -> CourierResult<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

/// Parse decrypted plaintext into an application message.
pub fn decode_message(plaintext: &[u8]) -> CourierResult<ApplicationMessage> {
    Ok(serde_json::from_slice(plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_handshake() {
        let frame = decode_frame(br#"{"type":"Handshake","pkg":"AAEC"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Handshake {
                public_key: "AAEC".into()
            }
        );
    }

    #[test]
    fn decode_message_pkg_with_iv() {
        let frame = decode_frame(br#"{"type":"MessagePkg","pkg":"Y2lwaGVy","iv":"bm9uY2U="}"#)
            .unwrap();
        assert_eq!(
            frame,
            Frame::EncryptedMessage {
                ciphertext: "Y2lwaGVy".into(),
                nonce: Some("bm9uY2U=".into()),
            }
        );
    }

    #[test]
    fn decode_message_pkg_without_iv_defers_validation() {
        let frame = decode_frame(br#"{"type":"MessagePkg","pkg":"Y2lwaGVy"}"#).unwrap();
        assert!(matches!(frame, Frame::EncryptedMessage { nonce: None, .. }));
    }

    #[test]
    fn unknown_kind_is_not_an_error() {
        let frame = decode_frame(br#"{"type":"Typing","pkg":{"on":true}}"#).unwrap();
        assert_eq!(frame.kind(), "Typing");
    }

    #[test]
    fn non_json_is_codec_error() {
        let err = decode_frame(b"not json").unwrap_err();
        assert!(matches!(err, CourierError::Codec(_)));
    }

    #[test]
    fn handshake_pkg_must_be_string() {
        let err = decode_frame(br#"{"type":"Handshake","pkg":42}"#).unwrap_err();
        assert!(matches!(err, CourierError::InvalidMessage(_)));
    }

    #[test]
    fn encoded_frame_decodes_back() {
        let frame = Frame::EncryptedMessage {
            ciphertext: b64_encode(b"sealed"),
            nonce: Some(b64_encode(&[7u8; 12])),
        };
        let text = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(text.as_bytes()).unwrap(), frame);
    }

    #[test]
    fn bad_base64_is_codec_error() {
        assert!(matches!(b64_decode("***"), Err(CourierError::Codec(_))));
    }
}
