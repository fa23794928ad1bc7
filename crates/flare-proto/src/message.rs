//! Presence protocol messages.

use crate::error::ProtoError;
use bincode::Options;
use flare_crypto::Proof;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire form of a presence record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Nickname
    pub nick: String,
    /// Peer identifier bytes
    pub peer_id: Vec<u8>,
    /// Encoded addresses
    pub addrs: Vec<Vec<u8>>,
}

/// Presence protocol messages. Exactly one variant per frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlareMessage {
    /// Initiator opens the handshake
    Authen {
        /// Initiator nonce
        nonce: [u8; 32],
    },

    /// Responder proves knowledge of the secret and challenges the initiator
    Challenge {
        /// `H(salt || secret || initiator nonce)`
        proof: Proof,
        /// Responder salt
        salt: [u8; 32],
        /// Responder nonce
        nonce: [u8; 32],
    },

    /// Initiator proves knowledge of the secret
    Response {
        /// `H(salt || secret || responder nonce)`
        proof: Proof,
        /// Initiator salt
        salt: [u8; 32],
    },

    /// Register (or overwrite) the sender's presence in a domain
    Announce {
        /// Presence domain
        domain: String,
        /// The sender's record
        peer_info: PeerInfo,
    },

    /// Ask for every other peer present in a domain
    GetPeers {
        /// Presence domain
        domain: String,
    },

    /// Answer to [`FlareMessage::GetPeers`]
    PeerList {
        /// Present peers, excluding the requester
        peers: Vec<PeerInfo>,
    },
}

/// Message discriminant, for logging and errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// [`FlareMessage::Authen`]
    Authen,
    /// [`FlareMessage::Challenge`]
    Challenge,
    /// [`FlareMessage::Response`]
    Response,
    /// [`FlareMessage::Announce`]
    Announce,
    /// [`FlareMessage::GetPeers`]
    GetPeers,
    /// [`FlareMessage::PeerList`]
    PeerList,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Authen => "AUTHEN",
            Self::Challenge => "CHALLENGE",
            Self::Response => "RESPONSE",
            Self::Announce => "ANNOUNCE",
            Self::GetPeers => "GETPEERS",
            Self::PeerList => "PEERLIST",
        };
        f.write_str(name)
    }
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

impl FlareMessage {
    /// Serialize message to bytes
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Encode`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        wire_options()
            .serialize(self)
            .map_err(|e| ProtoError::Encode(e.to_string()))
    }

    /// Deserialize message from bytes
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Decode`] for unknown tags, truncated fields or
    /// trailing garbage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        wire_options()
            .deserialize(bytes)
            .map_err(|e| ProtoError::Decode(e.to_string()))
    }

    /// Get the message discriminant
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Authen { .. } => MessageKind::Authen,
            Self::Challenge { .. } => MessageKind::Challenge,
            Self::Response { .. } => MessageKind::Response,
            Self::Announce { .. } => MessageKind::Announce,
            Self::GetPeers { .. } => MessageKind::GetPeers,
            Self::PeerList { .. } => MessageKind::PeerList,
        }
    }
}
