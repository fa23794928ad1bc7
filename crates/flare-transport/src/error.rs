//! Transport error types.

use flare_crypto::PeerId;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Dial or identification missed its deadline
    #[error("transport timeout")]
    Timeout,

    /// The remote side failed identification
    #[error("identification failed: {0}")]
    Identify(String),

    /// Dialed peer proved a different identity than expected
    #[error("peer id mismatch: expected {expected}, got {actual}")]
    PeerIdMismatch {
        /// Identity we dialed
        expected: PeerId,
        /// Identity the remote proved
        actual: PeerId,
    },

    /// No known address can be dialed for the peer
    #[error("no dialable address for peer {0}")]
    NoDialableAddress(PeerId),

    /// The host cannot perform the requested operation
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Connection already closed
    #[error("connection closed")]
    Closed,
}
