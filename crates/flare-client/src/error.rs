//! Client error types.

use flare_crypto::PeerId;
use flare_proto::ProtoError;
use flare_transport::TransportError;
use thiserror::Error;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// Presence protocol failure
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    /// Transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// No direct connection appeared before the polling ceiling
    #[error("no direct connection to {0}")]
    DirectTimeout(PeerId),

    /// Shutdown was requested
    #[error("shutting down")]
    Shutdown,
}

impl ClientError {
    /// Whether the error is an authentication failure, which retrying with
    /// the same secret will not fix
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Proto(ProtoError::AuthFailed))
    }

    /// Whether trying again later could succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !self.is_auth_failure() && !matches!(self, Self::Shutdown)
    }
}
