//! Daemon error types.

use flare_crypto::PeerId;
use flare_proto::ProtoError;
use thiserror::Error;

/// Presence directory errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    /// The identity already holds an open session
    #[error("peer {0} already has an active session")]
    DuplicateSession(PeerId),

    /// A session tried to announce a record for another identity
    #[error("session for {authenticated} announced record for {announced}")]
    IdentityMismatch {
        /// Identity proven by the session's connection
        authenticated: PeerId,
        /// Identity in the announced record
        announced: PeerId,
    },
}

/// Errors ending a presence session
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Protocol or stream failure
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// Directory refused the request
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}
