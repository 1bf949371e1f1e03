use thiserror::Error;

/// Errors produced by the courier protocol layer.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid peer key: {0}")]
    InvalidPeerKey(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("invalid nonce: expected {expected} bytes, got {actual}")]
    InvalidNonce { expected: usize, actual: usize },

    #[error("nonce reused under the current session key")]
    NonceReused,

    #[error("session key exhausted after {0} messages, handshake again")]
    RekeyRequired(usize),

    #[error("handshake required before {0}")]
    HandshakeRequired(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("worker pool closed")]
    PoolClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl CourierError {
    /// Whether the error only invalidates the frame being processed.
    ///
    /// Malformed input and protocol-sequence violations drop the offending
    /// frame and keep the connection; everything else ends it.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            CourierError::Codec(_)
                | CourierError::InvalidMessage(_)
                | CourierError::InvalidPeerKey(_)
                | CourierError::AuthenticationFailed
                | CourierError::InvalidNonce { .. }
                | CourierError::NonceReused
                | CourierError::RekeyRequired(_)
                | CourierError::HandshakeRequired(_)
        )
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(e: serde_json::Error) -> Self {
        CourierError::Codec(e.to_string())
    }
}

impl From<base64::DecodeError> for CourierError {
    fn from(e: base64::DecodeError) -> Self {
        CourierError::Codec(format!("base64: {e}"))
    }
}

pub type CourierResult<T> = Result<T, CourierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_local_classification() {
        assert!(CourierError::AuthenticationFailed.is_frame_local());
        assert!(CourierError::Codec("bad".into()).is_frame_local());
        assert!(CourierError::HandshakeRequired("MessagePkg".into()).is_frame_local());
        assert!(CourierError::RekeyRequired(4096).is_frame_local());
        assert!(!CourierError::Transport("closed".into()).is_frame_local());
        assert!(!CourierError::PoolClosed.is_frame_local());
    }

    #[test]
    fn nonce_error_message_names_lengths() {
        let e = CourierError::InvalidNonce {
            expected: 12,
            actual: 8,
        };
        assert_eq!(e.to_string(), "invalid nonce: expected 12 bytes, got 8");
    }
}
