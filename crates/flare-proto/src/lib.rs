//! # Flare Protocol
//!
//! Wire protocol spoken between Flare clients and the rendezvous daemon.
//!
//! A presence session is a single bidirectional stream. Every message is a
//! length-prefixed bincode frame carrying one [`FlareMessage`] variant:
//!
//! ```text
//! client                                   daemon
//!   | -- AUTHEN { nonce_c } ------------------> |
//!   | <-- CHALLENGE { proof_d, salt_d, nonce_d }|   proof_d = H(salt_d || k || nonce_c)
//!   | -- RESPONSE { proof_c, salt_c } --------> |   proof_c = H(salt_c || k || nonce_d)
//!   | -- ANNOUNCE { domain, peer_info } ------> |
//!   | -- GETPEERS { domain } -----------------> |
//!   | <-- PEERLIST { peers } ------------------ |
//! ```
//!
//! Anything received out of sequence is a protocol error and the stream is
//! reset.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod codec;
pub mod error;
pub mod message;
pub mod peer;

pub use auth::{authenticate_initiator, authenticate_responder};
pub use codec::{MessageStream, Stream};
pub use error::ProtoError;
pub use message::{FlareMessage, MessageKind, PeerInfo};
pub use peer::{AddrInfo, Domain, PeerAddr, PresenceRecord};

use std::time::Duration;

/// Protocol identifier used to open presence streams
pub const PROTOCOL_ID: &str = "/flare/presence/1.0.0";

/// Maximum frame accepted during the handshake and by the daemon (4 KiB)
pub const MAX_HANDSHAKE_FRAME: usize = 4096;

/// Maximum PEERLIST frame accepted by a client (1 MiB)
pub const MAX_PEERLIST_FRAME: usize = 1 << 20;

/// Deadline applied to the handshake and to every request/response exchange
pub const IO_DEADLINE: Duration = Duration::from_secs(60);

/// The daemon drops a session that sends nothing for this long. Clients
/// keep a session alive by re-announcing well within it.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
