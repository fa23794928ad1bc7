//! Identified TCP host.
//!
//! Every stream is its own TCP connection: the dialer identifies itself,
//! proves the remote identity, and names the protocol. Connections opened
//! without a protocol ("bare") exist only to keep a path to the peer alive
//! and are watched until either side closes them.

use crate::error::TransportError;
use crate::host::{ConnectionId, ConnectionObserver, Host, ManagedConnection, Reservation};
use crate::identify::{identify_inbound, identify_outbound};
use crate::nat::{self, NatEvent, NatTransport};
use crate::DIAL_TIMEOUT;
use async_trait::async_trait;
use flare_crypto::{Identity, PeerId};
use flare_proto::{AddrInfo, PeerAddr, Stream};
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::time::Instant;

/// Lifetime of a relay reservation
pub const RESERVATION_TTL: Duration = Duration::from_secs(60 * 60);

/// Pending inbound protocol streams before new ones are reset
const INBOUND_BACKLOG: usize = 64;

/// Idle time before the kernel starts checking a silent connection
const KEEPALIVE_TIME: Duration = Duration::from_secs(5 * 60);

/// Interval between keepalive packets
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Socket options for every identified connection. Keepalive packets
/// surface a peer that vanished without closing as a read error.
fn configure(socket: &TcpStream) -> io::Result<()> {
    socket.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(socket).set_tcp_keepalive(&keepalive)
}

/// A protocol stream opened to this host by a remote peer
#[derive(Debug)]
pub struct InboundStream {
    /// Identity the remote proved
    pub peer: PeerId,
    /// Protocol the remote asked for
    pub protocol: String,
    /// The stream itself
    pub stream: HostStream,
}

/// Connection tracked by a [`TcpHost`]
#[derive(Debug)]
pub struct TcpConnection {
    id: ConnectionId,
    remote_peer: PeerId,
    remote_addr: PeerAddr,
    streams: AtomicU64,
    shutdown: Notify,
}

impl ManagedConnection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    fn remote_addr(&self) -> PeerAddr {
        self.remote_addr.clone()
    }

    fn open_streams(&self) -> usize {
        usize::try_from(self.streams.load(Ordering::Acquire)).unwrap_or(usize::MAX)
    }

    /// Bare connections shut down; a connection carrying a stream lives
    /// until its stream is dropped.
    fn close(&self) -> Result<(), TransportError> {
        self.shutdown.notify_one();
        Ok(())
    }
}

/// A protocol stream over its own identified TCP connection
#[derive(Debug)]
pub struct HostStream {
    stream: TcpStream,
    conn: Arc<TcpConnection>,
    host: Weak<Inner>,
}

impl HostStream {
    /// Identity of the remote peer
    #[must_use]
    pub fn remote_peer(&self) -> PeerId {
        self.conn.remote_peer
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        self.conn.streams.fetch_sub(1, Ordering::AcqRel);
        if let Some(host) = self.host.upgrade() {
            host.remove(&self.conn);
        }
    }
}

impl AsyncRead for HostStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for HostStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl Stream for HostStream {
    fn reset(self) {
        // SO_LINGER 0 turns the close into an RST
        if let Err(e) = SockRef::from(&self.stream).set_linger(Some(Duration::ZERO)) {
            tracing::debug!("failed to set linger before reset: {e}");
        }
    }
}

struct Inner {
    identity: Identity,
    listen_addrs: Mutex<Vec<PeerAddr>>,
    peers: Mutex<HashMap<PeerId, Vec<SocketAddr>>>,
    connections: Mutex<HashMap<ConnectionId, Arc<TcpConnection>>>,
    observer: Mutex<Option<Arc<dyn ConnectionObserver>>>,
    nat_tx: broadcast::Sender<NatEvent>,
    stun_servers: Vec<SocketAddr>,
    nat_started: AtomicBool,
    next_id: AtomicU64,
}

impl Inner {
    fn register(&self, remote_peer: PeerId, remote: SocketAddr, streams: u64) -> Arc<TcpConnection> {
        let conn = Arc::new(TcpConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            remote_peer,
            remote_addr: PeerAddr::from_socket_addr(remote, "tcp"),
            streams: AtomicU64::new(streams),
            shutdown: Notify::new(),
        });
        self.connections.lock().insert(conn.id, conn.clone());

        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer.connected(conn.clone());
        }
        conn
    }

    fn remove(&self, conn: &TcpConnection) {
        if self.connections.lock().remove(&conn.id).is_none() {
            return;
        }
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer.disconnected(conn);
        }
    }

    fn dialable(&self, peer: &PeerId) -> Vec<SocketAddr> {
        self.peers.lock().get(peer).cloned().unwrap_or_default()
    }
}

/// Hold a bare connection open until the remote hangs up or it is closed
fn watch_bare(host: &Arc<Inner>, mut socket: TcpStream, conn: Arc<TcpConnection>) {
    let host = Arc::downgrade(host);
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            tokio::select! {
                read = socket.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                },
                () = conn.shutdown.notified() => break,
            }
        }
        tracing::debug!("Bare connection {} to {} closed", conn.id, conn.remote_peer.short());
        if let Some(host) = host.upgrade() {
            host.remove(&conn);
        }
    });
}

/// A [`Host`] over identified TCP connections
#[derive(Clone)]
pub struct TcpHost {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TcpHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpHost")
            .field("peer_id", &self.inner.identity.peer_id())
            .field("connections", &self.inner.connections.lock().len())
            .finish_non_exhaustive()
    }
}

impl TcpHost {
    /// Create a host with the given identity. NAT classification runs once,
    /// after the first successful dial, against `stun_servers`.
    #[must_use]
    pub fn new(identity: Identity, stun_servers: Vec<SocketAddr>) -> Self {
        let (nat_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                identity,
                listen_addrs: Mutex::new(Vec::new()),
                peers: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                observer: Mutex::new(None),
                nat_tx,
                stun_servers,
                nat_started: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Route connection open/close notifications to `observer`
    pub fn set_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        *self.inner.observer.lock() = Some(observer);
    }

    /// Accept connections on `addr`. Protocol streams are delivered on the
    /// returned channel; bare connections are tracked by the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn listen(
        &self,
        addr: SocketAddr,
    ) -> Result<(SocketAddr, mpsc::Receiver<InboundStream>), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        self.inner
            .listen_addrs
            .lock()
            .push(PeerAddr::from_socket_addr(local, "tcp"));
        tracing::info!("Listening on {local}");

        let (tx, rx) = mpsc::channel(INBOUND_BACKLOG);
        let host = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let (socket, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {e}");
                        continue;
                    }
                };
                let Some(inner) = host.upgrade() else { break };
                let tx = tx.clone();
                tokio::spawn(accept(inner, socket, remote, tx));
            }
        });

        Ok((local, rx))
    }

    fn spawn_nat_detection(&self) {
        if self.inner.stun_servers.is_empty() || self.inner.nat_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let servers = self.inner.stun_servers.clone();
        let nat_tx = self.inner.nat_tx.clone();
        tokio::spawn(async move {
            match nat::detect(&servers).await {
                Ok(nat_type) => {
                    tracing::info!("NAT type: {nat_type}");
                    // STUN classifies UDP mappings; TCP mappings are assumed
                    // to follow the same policy.
                    for transport in [NatTransport::Udp, NatTransport::Tcp] {
                        if nat_tx.send(NatEvent { transport, nat_type }).is_err() {
                            tracing::trace!("No NAT subscribers for {transport:?}");
                        }
                    }
                }
                Err(e) => tracing::warn!("NAT detection failed: {e}"),
            }
        });
    }

    async fn dial(
        &self,
        peer: &PeerId,
        protocol: Option<&str>,
    ) -> Result<(TcpStream, SocketAddr), TransportError> {
        let candidates = self.inner.dialable(peer);
        if candidates.is_empty() {
            return Err(TransportError::NoDialableAddress(*peer));
        }

        let mut last_err = TransportError::NoDialableAddress(*peer);
        for addr in candidates {
            let attempt = async {
                let mut socket = TcpStream::connect(addr).await?;
                configure(&socket)?;
                identify_outbound(&mut socket, &self.inner.identity, Some(peer), protocol).await?;
                Ok::<_, TransportError>(socket)
            };
            match tokio::time::timeout(DIAL_TIMEOUT, attempt).await {
                Ok(Ok(socket)) => return Ok((socket, addr)),
                Ok(Err(e)) => {
                    tracing::debug!("Dial {addr} for {} failed: {e}", peer.short());
                    last_err = e;
                }
                Err(_) => last_err = TransportError::Timeout,
            }
        }
        Err(last_err)
    }
}

async fn accept(
    inner: Arc<Inner>,
    mut socket: TcpStream,
    remote: SocketAddr,
    tx: mpsc::Sender<InboundStream>,
) {
    if let Err(e) = configure(&socket) {
        tracing::debug!("Configuring inbound socket from {remote} failed: {e}");
        return;
    }
    let identified =
        tokio::time::timeout(DIAL_TIMEOUT, identify_inbound(&mut socket, &inner.identity)).await;
    let (peer, protocol) = match identified {
        Ok(Ok(identified)) => identified,
        Ok(Err(e)) => {
            tracing::debug!("Inbound identification from {remote} failed: {e}");
            return;
        }
        Err(_) => {
            tracing::debug!("Inbound identification from {remote} timed out");
            return;
        }
    };

    match protocol {
        None => {
            let conn = inner.register(peer, remote, 0);
            watch_bare(&inner, socket, conn);
        }
        Some(protocol) => {
            let conn = inner.register(peer, remote, 1);
            let stream = HostStream {
                stream: socket,
                conn,
                host: Arc::downgrade(&inner),
            };
            if let Err(mpsc::error::TrySendError::Full(rejected) | mpsc::error::TrySendError::Closed(rejected)) =
                tx.try_send(InboundStream {
                    peer,
                    protocol,
                    stream,
                })
            {
                tracing::debug!("No handler for {} from {}", rejected.protocol, peer.short());
                rejected.stream.reset();
            }
        }
    }
}

#[async_trait]
impl Host for TcpHost {
    type Stream = HostStream;

    fn local_peer_id(&self) -> PeerId {
        self.inner.identity.peer_id()
    }

    fn listen_addrs(&self) -> Vec<PeerAddr> {
        self.inner.listen_addrs.lock().clone()
    }

    async fn connect(&self, peer: &AddrInfo) -> Result<(), TransportError> {
        let direct: Vec<SocketAddr> = peer
            .addrs
            .iter()
            .filter(|addr| !addr.is_relayed())
            .filter_map(PeerAddr::socket_addr)
            .collect();
        if direct.is_empty() {
            return Err(if peer.addrs.iter().any(PeerAddr::is_relayed) {
                TransportError::Unsupported("dialing through relay circuits")
            } else {
                TransportError::NoDialableAddress(peer.id)
            });
        }
        {
            let mut peers = self.inner.peers.lock();
            let known = peers.entry(peer.id).or_default();
            for addr in direct {
                if !known.contains(&addr) {
                    known.push(addr);
                }
            }
        }

        let connected = self
            .inner
            .connections
            .lock()
            .values()
            .any(|conn| conn.remote_peer == peer.id);
        if connected {
            return Ok(());
        }

        let (socket, remote) = self.dial(&peer.id, None).await?;
        let conn = self.inner.register(peer.id, remote, 0);
        tracing::debug!("Connected to {} at {remote}", peer.id.short());
        watch_bare(&self.inner, socket, conn);
        self.spawn_nat_detection();
        Ok(())
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<HostStream, TransportError> {
        let (socket, remote) = self.dial(peer, Some(protocol)).await?;
        let conn = self.inner.register(*peer, remote, 1);
        Ok(HostStream {
            stream: socket,
            conn,
            host: Arc::downgrade(&self.inner),
        })
    }

    fn subscribe_nat(&self) -> broadcast::Receiver<NatEvent> {
        self.inner.nat_tx.subscribe()
    }

    async fn reserve(&self, relay: &AddrInfo) -> Result<Reservation, TransportError> {
        self.connect(relay).await?;
        let local = self.local_peer_id();
        let addrs = relay
            .addrs
            .iter()
            .filter(|addr| !addr.is_relayed())
            .map(|addr| addr.circuit(&relay.id, &local))
            .collect();
        Ok(Reservation {
            relay: relay.id,
            addrs,
            expires_at: Instant::now() + RESERVATION_TTL,
        })
    }

    fn connections_to(&self, peer: &PeerId) -> Vec<PeerAddr> {
        self.inner
            .connections
            .lock()
            .values()
            .filter(|conn| conn.remote_peer == *peer)
            .map(|conn| conn.remote_addr.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(bool, ConnectionId)>>,
    }

    impl ConnectionObserver for Recorder {
        fn connected(&self, conn: Arc<dyn ManagedConnection>) {
            self.events.lock().push((true, conn.id()));
        }

        fn disconnected(&self, conn: &dyn ManagedConnection) {
            self.events.lock().push((false, conn.id()));
        }
    }

    async fn listening_host() -> (TcpHost, AddrInfo, mpsc::Receiver<InboundStream>) {
        let host = TcpHost::new(Identity::generate(), Vec::new());
        let (local, rx) = host.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let info = AddrInfo {
            id: host.local_peer_id(),
            addrs: vec![PeerAddr::from_socket_addr(local, "tcp")],
        };
        (host, info, rx)
    }

    #[tokio::test]
    async fn test_open_stream_delivers_protocol() {
        let (_server, server_info, mut inbound) = listening_host().await;
        let client = TcpHost::new(Identity::generate(), Vec::new());

        client.connect(&server_info).await.unwrap();
        let mut stream = client.open_stream(&server_info.id, "/test/1").await.unwrap();
        stream.write_all(b"ping").await.unwrap();

        let mut accepted = inbound.recv().await.unwrap();
        assert_eq!(accepted.peer, client.local_peer_id());
        assert_eq!(accepted.protocol, "/test/1");
        let mut buf = [0u8; 4];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_streams_enable_keepalive() {
        let (_server, server_info, mut inbound) = listening_host().await;
        let client = TcpHost::new(Identity::generate(), Vec::new());

        client.connect(&server_info).await.unwrap();
        let stream = client.open_stream(&server_info.id, "/test/1").await.unwrap();
        assert!(SockRef::from(&stream.stream).keepalive().unwrap());

        let accepted = inbound.recv().await.unwrap();
        assert!(SockRef::from(&accepted.stream.stream).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_connect_tracks_connection() {
        let (_server, server_info, _inbound) = listening_host().await;
        let client = TcpHost::new(Identity::generate(), Vec::new());
        let recorder = Arc::new(Recorder::default());
        client.set_observer(recorder.clone());

        client.connect(&server_info).await.unwrap();
        // Second connect reuses the existing connection
        client.connect(&server_info).await.unwrap();

        let addrs = client.connections_to(&server_info.id);
        assert_eq!(addrs, server_info.addrs);
        assert!(!addrs[0].is_relayed());
        assert_eq!(recorder.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_drop_notifies_observer() {
        let (_server, server_info, _inbound) = listening_host().await;
        let client = TcpHost::new(Identity::generate(), Vec::new());
        let recorder = Arc::new(Recorder::default());
        client.set_observer(recorder.clone());

        client.connect(&server_info).await.unwrap();
        let stream = client.open_stream(&server_info.id, "/test/1").await.unwrap();
        let id = stream.conn.id;
        drop(stream);

        assert!(recorder.events.lock().contains(&(false, id)));
    }

    #[tokio::test]
    async fn test_reserve_synthesizes_circuit_addrs() {
        let (_relay, relay_info, _inbound) = listening_host().await;
        let client = TcpHost::new(Identity::generate(), Vec::new());

        let reservation = client.reserve(&relay_info).await.unwrap();
        assert_eq!(reservation.relay, relay_info.id);
        assert_eq!(reservation.addrs.len(), 1);
        assert!(reservation.addrs[0].is_relayed());
    }

    #[tokio::test]
    async fn test_circuit_only_peer_unsupported() {
        let client = TcpHost::new(Identity::generate(), Vec::new());
        let relay = Identity::generate().peer_id();
        let target = Identity::generate().peer_id();
        let addr: PeerAddr = "/ip4/127.0.0.1/tcp/1".parse().unwrap();
        let info = AddrInfo {
            id: target,
            addrs: vec![addr.circuit(&relay, &target)],
        };

        assert!(matches!(
            client.connect(&info).await,
            Err(TransportError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_open_stream_unknown_peer() {
        let client = TcpHost::new(Identity::generate(), Vec::new());
        let stranger = Identity::generate().peer_id();
        assert!(matches!(
            client.open_stream(&stranger, "/test/1").await,
            Err(TransportError::NoDialableAddress(_))
        ));
    }
}
