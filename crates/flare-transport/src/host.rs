//! The transport host seam.

use crate::error::TransportError;
use crate::nat::NatEvent;
use async_trait::async_trait;
use flare_crypto::PeerId;
use flare_proto::{AddrInfo, PeerAddr, Stream};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Host-unique connection handle
pub type ConnectionId = u64;

/// A slot at a relay through which this node can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Relay holding the slot
    pub relay: PeerId,
    /// Circuit addresses other peers can dial
    pub addrs: Vec<PeerAddr>,
    /// When the relay drops the slot unless renewed
    pub expires_at: Instant,
}

/// Peer-to-peer host driven by the hole punching orchestrator
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// Stream type returned by [`Host::open_stream`]
    type Stream: Stream + Sync;

    /// This host's identity
    fn local_peer_id(&self) -> PeerId;

    /// Addresses this host listens on
    fn listen_addrs(&self) -> Vec<PeerAddr>;

    /// Establish (or reuse) a connection to `peer`
    async fn connect(&self, peer: &AddrInfo) -> Result<(), TransportError>;

    /// Open a protocol stream to a peer this host knows addresses for
    async fn open_stream(&self, peer: &PeerId, protocol: &str)
    -> Result<Self::Stream, TransportError>;

    /// Subscribe to NAT classification changes
    fn subscribe_nat(&self) -> broadcast::Receiver<NatEvent>;

    /// Reserve a slot at `relay`
    async fn reserve(&self, relay: &AddrInfo) -> Result<Reservation, TransportError>;

    /// Remote addresses of every open connection to `peer`
    fn connections_to(&self, peer: &PeerId) -> Vec<PeerAddr>;
}

/// An open connection as seen by the connection lifecycle manager
pub trait ManagedConnection: Send + Sync {
    /// Host-unique handle
    fn id(&self) -> ConnectionId;

    /// Identity of the remote peer
    fn remote_peer(&self) -> PeerId;

    /// Remote address
    fn remote_addr(&self) -> PeerAddr;

    /// Number of application streams currently open on the connection
    fn open_streams(&self) -> usize;

    /// Close the connection
    fn close(&self) -> Result<(), TransportError>;
}

/// Receives connection open/close notifications from a host
pub trait ConnectionObserver: Send + Sync {
    /// A connection was established
    fn connected(&self, conn: Arc<dyn ManagedConnection>);

    /// A connection went away, for any reason
    fn disconnected(&self, conn: &dyn ManagedConnection);
}
