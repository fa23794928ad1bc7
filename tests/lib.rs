//! Simulated network for Flare integration tests.
//!
//! [`SimNetwork`] hosts an in-process [`Daemon`]; every [`SimHost`] opening
//! a presence stream to it gets one end of an in-memory duplex while the
//! daemon serves the other. Relays, bootstrappers and punched connections
//! are simulated by bookkeeping only.

use async_trait::async_trait;
use flare_crypto::{Identity, PeerId};
use flare_daemon::Daemon;
use flare_proto::{AddrInfo, PROTOCOL_ID, PeerAddr};
use flare_transport::{Host, NatEvent, NatTransport, NatType, Reservation, TransportError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Shared secret used by the simulated daemon
pub const SECRET: &str = "integration-secret";

/// In-memory network around one rendezvous daemon
pub struct SimNetwork {
    daemon: Arc<Daemon>,
    server: AddrInfo,
    sessions: Mutex<HashMap<PeerId, Vec<JoinHandle<()>>>>,
}

impl SimNetwork {
    /// Network whose daemon expects `secret`
    pub fn new(secret: &str) -> Arc<Self> {
        Arc::new(Self {
            daemon: Arc::new(Daemon::new(secret)),
            server: sim_info("/ip4/10.0.0.1/tcp/4001"),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// The daemon
    pub fn daemon(&self) -> &Arc<Daemon> {
        &self.daemon
    }

    /// Where to reach the daemon
    pub fn server(&self) -> AddrInfo {
        self.server.clone()
    }

    /// A new host with a fresh identity
    pub fn host(self: &Arc<Self>) -> SimHost {
        let (nat_tx, _) = broadcast::channel(16);
        SimHost {
            id: Identity::generate().peer_id(),
            network: Arc::clone(self),
            nat_tx,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Abort every daemon-side session of `peer`, as a dropped connection
    /// would
    pub fn kill_sessions(&self, peer: &PeerId) {
        if let Some(handles) = self.sessions.lock().remove(peer) {
            for handle in handles {
                handle.abort();
            }
        }
    }

    /// Wait until the directory holds exactly `n` sessions
    pub async fn wait_sessions(&self, n: usize) {
        let directory = self.daemon.directory();
        tokio::time::timeout(Duration::from_secs(5), async {
            while directory.session_count() != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {n} sessions, have {}", directory.session_count()));
    }
}

/// An `AddrInfo` with a random identity at `addr`
pub fn sim_info(addr: &str) -> AddrInfo {
    AddrInfo {
        id: Identity::generate().peer_id(),
        addrs: vec![addr.parse().unwrap()],
    }
}

/// Lease granted by simulated relays unless overridden
const DEFAULT_LEASE: Duration = Duration::from_secs(3600);

#[derive(Default)]
struct SimState {
    connected: HashMap<PeerId, Instant>,
    punch_after: HashMap<PeerId, Duration>,
    dialed: HashMap<PeerId, u32>,
    polled: HashMap<PeerId, u32>,
    connect_calls: u32,
    connect_failures: u32,
    reserve_calls: u32,
    reserve_failures: u32,
    stream_calls: u32,
    stream_failures: u32,
    lease: Option<Duration>,
    nat_on_connect: Option<NatType>,
}

/// A simulated peer-to-peer host
pub struct SimHost {
    id: PeerId,
    network: Arc<SimNetwork>,
    nat_tx: broadcast::Sender<NatEvent>,
    state: Mutex<SimState>,
}

impl SimHost {
    /// Fail the next `n` connects
    pub fn fail_connects(&self, n: u32) {
        self.state.lock().connect_failures = n;
    }

    /// Fail the next `n` reservations
    pub fn fail_reservations(&self, n: u32) {
        self.state.lock().reserve_failures = n;
    }

    /// Fail the next `n` presence stream opens, so the request that needs
    /// a fresh session fails
    pub fn fail_streams(&self, n: u32) {
        self.state.lock().stream_failures = n;
    }

    /// Relays grant reservations lasting `lease`
    pub fn lease(&self, lease: Duration) {
        self.state.lock().lease = Some(lease);
    }

    /// Report `nat_type` for both transports on the next connect
    pub fn nat_on_connect(&self, nat_type: NatType) {
        self.state.lock().nat_on_connect = Some(nat_type);
    }

    /// A connection to `peer` turns direct `delay` after it is first dialed
    pub fn punch_after(&self, peer: PeerId, delay: Duration) {
        self.state.lock().punch_after.insert(peer, delay);
    }

    /// Number of connect calls so far
    pub fn connect_calls(&self) -> u32 {
        self.state.lock().connect_calls
    }

    /// Number of reserve calls so far
    pub fn reserve_calls(&self) -> u32 {
        self.state.lock().reserve_calls
    }

    /// Number of presence stream opens so far
    pub fn stream_calls(&self) -> u32 {
        self.state.lock().stream_calls
    }

    /// Number of times `peer` was dialed
    pub fn dials_to(&self, peer: &PeerId) -> u32 {
        self.state.lock().dialed.get(peer).copied().unwrap_or(0)
    }

    /// Number of times the connections to `peer` were inspected
    pub fn polls_of(&self, peer: &PeerId) -> u32 {
        self.state.lock().polled.get(peer).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Host for SimHost {
    type Stream = DuplexStream;

    fn local_peer_id(&self) -> PeerId {
        self.id
    }

    fn listen_addrs(&self) -> Vec<PeerAddr> {
        vec!["/ip4/192.168.1.10/tcp/4001".parse().unwrap()]
    }

    async fn connect(&self, peer: &AddrInfo) -> Result<(), TransportError> {
        let nat = {
            let mut state = self.state.lock();
            state.connect_calls += 1;
            *state.dialed.entry(peer.id).or_default() += 1;
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return Err(TransportError::Timeout);
            }
            state.connected.entry(peer.id).or_insert_with(Instant::now);
            state.nat_on_connect.take()
        };

        if let Some(nat_type) = nat {
            for transport in [NatTransport::Tcp, NatTransport::Udp] {
                let _ = self.nat_tx.send(NatEvent { transport, nat_type });
            }
        }
        Ok(())
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<DuplexStream, TransportError> {
        if *peer != self.network.server.id || protocol != PROTOCOL_ID {
            return Err(TransportError::Unsupported("simulated peers only serve presence"));
        }
        {
            let mut state = self.state.lock();
            state.stream_calls += 1;
            if state.stream_failures > 0 {
                state.stream_failures -= 1;
                return Err(TransportError::Timeout);
            }
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        let daemon = Arc::clone(&self.network.daemon);
        let id = self.id;
        let handle = tokio::spawn(async move { daemon.handle_stream(id, server).await });
        self.network.sessions.lock().entry(id).or_default().push(handle);
        Ok(client)
    }

    fn subscribe_nat(&self) -> broadcast::Receiver<NatEvent> {
        self.nat_tx.subscribe()
    }

    async fn reserve(&self, relay: &AddrInfo) -> Result<Reservation, TransportError> {
        let lease = {
            let mut state = self.state.lock();
            state.reserve_calls += 1;
            if state.reserve_failures > 0 {
                state.reserve_failures -= 1;
                return Err(TransportError::Timeout);
            }
            state.lease.unwrap_or(DEFAULT_LEASE)
        };
        Ok(Reservation {
            relay: relay.id,
            addrs: relay
                .addrs
                .iter()
                .map(|addr| addr.circuit(&relay.id, &self.id))
                .collect(),
            expires_at: Instant::now() + lease,
        })
    }

    fn connections_to(&self, peer: &PeerId) -> Vec<PeerAddr> {
        let mut guard = self.state.lock();
        *guard.polled.entry(*peer).or_default() += 1;
        let state = &*guard;
        let Some(opened) = state.connected.get(peer) else {
            return Vec::new();
        };

        let relay = Identity::generate().peer_id();
        let base: PeerAddr = "/ip4/198.51.100.1/tcp/4001".parse().unwrap();
        let mut addrs = vec![base.circuit(&relay, peer)];
        if let Some(delay) = state.punch_after.get(peer) {
            if opened.elapsed() >= *delay {
                addrs.push("/ip4/203.0.113.50/tcp/4001".parse().unwrap());
            }
        }
        addrs
    }
}
