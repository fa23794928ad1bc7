//! # Flare Transport
//!
//! The boundary between Flare's rendezvous logic and the peer-to-peer
//! transport underneath it.
//!
//! This crate provides:
//! - The [`Host`] trait the hole punching orchestrator drives
//! - [`ManagedConnection`] / [`ConnectionObserver`] seams consumed by the
//!   connection lifecycle manager
//! - NAT type classification over STUN ([`nat`])
//! - A minimal identified TCP host ([`tcp::TcpHost`]) used by the binaries
//!
//! Relaying and hole punching themselves belong to the transport; the TCP
//! host dials plain sockets and records relay reservations without
//! forwarding traffic through them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod host;
pub mod identify;
pub mod nat;
pub mod tcp;

pub use error::TransportError;
pub use host::{ConnectionId, ConnectionObserver, Host, ManagedConnection, Reservation};
pub use nat::{NatError, NatEvent, NatTransport, NatType};
pub use tcp::{HostStream, InboundStream, TcpHost};

use std::time::Duration;

/// Deadline for dialing a peer, including identification
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(60);
