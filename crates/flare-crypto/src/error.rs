//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Peer identifier bytes have the wrong length
    #[error("invalid peer id length: expected {expected}, got {actual}")]
    InvalidPeerIdLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Peer identifier text is not valid hex
    #[error("invalid peer id encoding: {0}")]
    InvalidPeerIdEncoding(String),

    /// Public key bytes are malformed
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Signature bytes are malformed or do not verify
    #[error("invalid signature")]
    InvalidSignature,

    /// Identity key file is malformed
    #[error("invalid identity key file {path}: {reason}")]
    InvalidKeyFile {
        /// Key file path
        path: String,
        /// What was wrong with it
        reason: String,
    },

    /// Identity key file I/O failed
    #[error("identity key file I/O: {0}")]
    Io(#[from] std::io::Error),
}
