//! Protocol error types.

use crate::message::MessageKind;
use thiserror::Error;

/// Errors raised while speaking the presence protocol
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Underlying stream I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A read or write missed its deadline
    #[error("deadline exceeded")]
    Timeout,

    /// The peer closed the stream at a frame boundary
    #[error("stream closed")]
    Closed,

    /// A frame header announced more bytes than this side accepts
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Announced size
        size: usize,
        /// Accepted maximum
        max: usize,
    },

    /// A frame body could not be decoded into a message
    #[error("malformed message: {0}")]
    Decode(String),

    /// A message could not be encoded
    #[error("message encoding failed: {0}")]
    Encode(String),

    /// A well-formed message arrived in the wrong phase
    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        /// What the current phase allows
        expected: &'static str,
        /// What arrived
        got: MessageKind,
    },

    /// Identity bytes did not decode to a peer id
    #[error("malformed peer id: {0}")]
    InvalidPeerId(#[from] flare_crypto::CryptoError),

    /// Address bytes did not decode to an address
    #[error("malformed address: {0}")]
    InvalidAddress(String),

    /// The remote side's proof did not verify
    #[error("authentication failure")]
    AuthFailed,

    /// Nonce or salt generation failed
    #[error("random number generation failed")]
    RandomFailed,
}

impl ProtoError {
    /// Whether this error means the peer broke the protocol (as opposed to
    /// the transport failing underneath it)
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge { .. }
                | Self::Decode(_)
                | Self::UnexpectedMessage { .. }
                | Self::InvalidPeerId(_)
                | Self::InvalidAddress(_)
        )
    }

    /// Whether this error is a missed deadline
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ProtoError::Decode("bad".into()).is_protocol_violation());
        assert!(ProtoError::FrameTooLarge { size: 9000, max: 4096 }.is_protocol_violation());
        assert!(!ProtoError::Timeout.is_protocol_violation());
        assert!(ProtoError::Timeout.is_timeout());
        assert!(!ProtoError::AuthFailed.is_protocol_violation());
    }

    #[test]
    fn test_error_display() {
        let err = ProtoError::UnexpectedMessage {
            expected: "CHALLENGE",
            got: MessageKind::PeerList,
        };
        assert_eq!(err.to_string(), "unexpected message: expected CHALLENGE, got PEERLIST");
    }
}
