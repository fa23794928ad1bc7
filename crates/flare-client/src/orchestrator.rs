//! Hole punching orchestrator.
//!
//! One instance runs per domain:
//!
//! ```text
//! DetectNat --symmetric--> stop
//!     |
//! Reserve relay slot (retry forever) -> Announce (retry forever)
//!     |                                      ^
//!     |   every relay_refresh, or sooner ----+  (parallel)
//!     |   if the lease runs out first
//!     |                       keepalive -> re-announce when idle (parallel)
//!     v
//! sleep(initial jitter) -> ListPeers -> AttemptDirect(each) -> sleep(jitter) -> ListPeers ...
//! ```

use crate::connmgr::ConnManager;
use crate::error::ClientError;
use crate::rendezvous::RendezvousClient;
use crate::retry::{self, RetryPolicy};
use flare_crypto::PeerId;
use flare_proto::{AddrInfo, Domain, PeerAddr, PresenceRecord};
use flare_transport::{Host, NatTransport, NatType, Reservation};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

/// Protection tag held on the relay while a reservation is wanted
pub const RELAY_TAG: &str = "flare-relay";

/// Protection tag held on the rendezvous daemon
pub const RENDEZVOUS_TAG: &str = "flare-rendezvous";

/// Every wait the orchestrator performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Backoff for reservation, announce and list retries
    pub retry_backoff: Duration,
    /// Longest interval between relay refreshes
    pub relay_refresh: Duration,
    /// How long before a reservation expires to renew it
    pub renew_margin: Duration,
    /// How often to check the presence session for idleness
    pub keepalive: Duration,
    /// Bounds of the delay before the first round
    pub initial_delay: (Duration, Duration),
    /// Bounds of the delay between rounds
    pub round_interval: (Duration, Duration),
    /// Pause after reconnecting to bootstrappers before dialing a peer
    pub settle: Duration,
    /// How often to check for a direct connection
    pub poll_interval: Duration,
    /// How long to wait for a direct connection
    pub poll_timeout: Duration,
    /// How long to wait for a NAT classification
    pub nat_wait: Duration,
}

const MINUTE: Duration = Duration::from_secs(60);

impl Default for Timings {
    fn default() -> Self {
        Self {
            retry_backoff: MINUTE,
            relay_refresh: 30 * MINUTE,
            renew_margin: 5 * MINUTE,
            keepalive: 20 * MINUTE,
            initial_delay: (15 * MINUTE, 45 * MINUTE),
            round_interval: (30 * MINUTE, 90 * MINUTE),
            settle: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            poll_timeout: MINUTE,
            nat_wait: MINUTE,
        }
    }
}

/// A uniformly random duration in `[min, max]`
#[must_use]
pub fn jitter((min, max): (Duration, Duration)) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

/// Shortest wait between two reservations at the same relay
const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(1);

/// How long to wait before renewing a reservation that expires at
/// `expires_at`: `renew_margin` ahead of expiry (or half way through a
/// lease shorter than the margin), and never later than `relay_refresh`.
#[must_use]
pub fn renewal_delay(expires_at: Instant, timings: &Timings) -> Duration {
    let remaining = expires_at.saturating_duration_since(Instant::now());
    let before_expiry = remaining.saturating_sub(timings.renew_margin).max(remaining / 2);
    before_expiry
        .min(timings.relay_refresh)
        .max(MIN_RENEWAL_DELAY)
}

/// Poll `connections` every `interval` until one of the returned addresses
/// is direct, giving up after `ceiling`. Returns the number of checks made.
///
/// # Errors
///
/// Returns [`ClientError::DirectTimeout`] if only relayed connections (or
/// none) exist when the ceiling passes.
pub async fn poll_direct<F>(
    peer: &PeerId,
    mut connections: F,
    interval: Duration,
    ceiling: Duration,
) -> Result<u32, ClientError>
where
    F: FnMut() -> Vec<PeerAddr>,
{
    let deadline = Instant::now() + ceiling;
    let mut checks = 0u32;
    loop {
        checks += 1;
        if connections().iter().any(|addr| !addr.is_relayed()) {
            return Ok(checks);
        }
        if Instant::now() + interval > deadline {
            return Err(ClientError::DirectTimeout(*peer));
        }
        tokio::time::sleep(interval).await;
    }
}

/// Where one domain's orchestrator finds its infrastructure
#[derive(Debug, Clone)]
pub struct DomainSettings {
    /// Presence domain
    pub domain: Domain,
    /// Nickname to announce
    pub nick: String,
    /// Rendezvous daemon
    pub server: AddrInfo,
    /// Relay to reserve a slot at
    pub relay: AddrInfo,
    /// Peers dialed to learn our external addresses
    pub bootstrappers: Vec<AddrInfo>,
}

/// Per-domain hole punching state machine
pub struct HolePunchOrchestrator<H: Host> {
    host: Arc<H>,
    settings: Arc<DomainSettings>,
    timings: Timings,
    rendezvous: Arc<Mutex<RendezvousClient<H>>>,
    connmgr: Arc<ConnManager>,
    nat_type: Arc<parking_lot::Mutex<NatType>>,
    shutdown: watch::Receiver<bool>,
}

impl<H: Host> Clone for HolePunchOrchestrator<H> {
    fn clone(&self) -> Self {
        Self {
            host: Arc::clone(&self.host),
            settings: Arc::clone(&self.settings),
            timings: self.timings,
            rendezvous: Arc::clone(&self.rendezvous),
            connmgr: Arc::clone(&self.connmgr),
            nat_type: Arc::clone(&self.nat_type),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<H: Host> std::fmt::Debug for HolePunchOrchestrator<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HolePunchOrchestrator")
            .field("domain", &self.settings.domain)
            .field("nat_type", &*self.nat_type.lock())
            .finish_non_exhaustive()
    }
}

impl<H: Host> HolePunchOrchestrator<H> {
    /// Create an orchestrator. `secret` authenticates to the daemon.
    pub fn new(
        host: Arc<H>,
        settings: DomainSettings,
        secret: impl Into<String>,
        connmgr: Arc<ConnManager>,
        timings: Timings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let rendezvous = RendezvousClient::new(
            Arc::clone(&host),
            settings.server.clone(),
            settings.domain.clone(),
            secret,
        );
        Self {
            host,
            settings: Arc::new(settings),
            timings,
            rendezvous: Arc::new(Mutex::new(rendezvous)),
            connmgr,
            nat_type: Arc::new(parking_lot::Mutex::new(NatType::Unknown)),
            shutdown,
        }
    }

    /// Most recent NAT classification for this domain
    #[must_use]
    pub fn nat_type(&self) -> NatType {
        *self.nat_type.lock()
    }

    /// Run until shutdown, or until the NAT turns out to be symmetric.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Shutdown`] when interrupted, or the
    /// authentication failure if the daemon rejects the secret. Transient
    /// failures are logged and retried, never returned.
    pub async fn run(self) -> Result<(), ClientError> {
        let domain = self.settings.domain.clone();

        let nat_type = self.detect_nat().await?;
        if nat_type.is_symmetric() {
            tracing::error!("{domain}: symmetric NAT, direct connections are not possible");
            return Ok(());
        }

        self.connmgr.protect(&self.settings.relay.id, RELAY_TAG);
        self.connmgr.protect(&self.settings.server.id, RENDEZVOUS_TAG);

        let expires_at = self.reserve_and_announce().await?.expires_at;

        let refresher = self.clone();
        let refresh = tokio::spawn(async move { refresher.refresh_relay(expires_at).await });
        let keeper = self.clone();
        let keepalive = tokio::spawn(async move { keeper.keep_session_alive().await });

        let result = self.discover().await;
        refresh.abort();
        keepalive.abort();
        self.rendezvous.lock().await.close().await;
        result
    }

    /// Dial bootstrappers and wait for the transport to classify the NAT.
    /// Returns [`NatType::Unknown`] if no classification arrives in time.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Shutdown`] if interrupted.
    pub async fn detect_nat(&self) -> Result<NatType, ClientError> {
        let mut events = self.host.subscribe_nat();
        self.connect_bootstrappers().await;

        let transport = NatTransport::for_domain(&self.settings.domain);
        let deadline = Instant::now() + self.timings.nat_wait;
        let mut shutdown = self.shutdown.clone();

        let nat_type = loop {
            tokio::select! {
                event = tokio::time::timeout_at(deadline, events.recv()) => match event {
                    Ok(Ok(event)) if event.transport == transport => break event.nat_type,
                    Ok(Ok(_)) | Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => {}
                    Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) | Err(_) => {
                        break NatType::Unknown;
                    }
                },
                _ = shutdown.wait_for(|stop| *stop) => return Err(ClientError::Shutdown),
            }
        };

        tracing::info!("{}: NAT type {nat_type}", self.settings.domain);
        *self.nat_type.lock() = nat_type;
        Ok(nat_type)
    }

    /// Dial every bootstrapper, returning how many answered
    pub async fn connect_bootstrappers(&self) -> usize {
        let mut connected = 0;
        for peer in &self.settings.bootstrappers {
            match self.host.connect(peer).await {
                Ok(()) => connected += 1,
                Err(e) => tracing::warn!("Bootstrapper {} unreachable: {e}", peer.id.short()),
            }
        }
        connected
    }

    async fn reserve(&self) -> Result<Reservation, ClientError> {
        let relay = &self.settings.relay;
        self.host.connect(relay).await?;
        let reservation = self.host.reserve(relay).await?;
        tracing::info!(
            "{}: reserved slot at relay {} ({} addrs)",
            self.settings.domain,
            relay.id.short(),
            reservation.addrs.len()
        );
        Ok(reservation)
    }

    async fn announce(&self, addrs: Vec<PeerAddr>) -> Result<(), ClientError> {
        self.rendezvous
            .lock()
            .await
            .announce(&self.settings.nick, addrs)
            .await?;
        tracing::info!(
            domain = %self.settings.domain,
            nat = %self.nat_type(),
            "announced presence"
        );
        Ok(())
    }

    /// Reserve a relay slot and announce its addresses, retrying each step
    /// until it succeeds. Returns the reservation that was announced.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Shutdown`] if interrupted, or the
    /// authentication failure if the daemon rejects the secret.
    pub async fn reserve_and_announce(&self) -> Result<Reservation, ClientError> {
        let policy = RetryPolicy::forever(self.timings.retry_backoff);
        let mut shutdown = self.shutdown.clone();

        let reservation = policy
            .run("relay reservation", &mut shutdown, move || self.reserve())
            .await?;
        let addrs = &reservation.addrs;
        policy
            .run("announce", &mut shutdown, move || self.announce(addrs.clone()))
            .await?;
        Ok(reservation)
    }

    async fn refresh_relay(&self, mut expires_at: Instant) -> Result<(), ClientError> {
        let mut shutdown = self.shutdown.clone();
        loop {
            let wait = renewal_delay(expires_at, &self.timings);
            retry::sleep(wait, &mut shutdown).await?;
            tracing::debug!("{}: refreshing relay reservation", self.settings.domain);
            self.connect_bootstrappers().await;
            expires_at = self.reserve_and_announce().await?.expires_at;
        }
    }

    async fn keep_session_alive(&self) -> Result<(), ClientError> {
        let mut shutdown = self.shutdown.clone();
        loop {
            retry::sleep(self.timings.keepalive, &mut shutdown).await?;
            let result = self
                .rendezvous
                .lock()
                .await
                .maybe_keepalive(self.timings.keepalive)
                .await;
            if let Err(e) = result {
                tracing::warn!("{}: presence keepalive failed: {e}", self.settings.domain);
            }
        }
    }

    async fn discover(&self) -> Result<(), ClientError> {
        let mut shutdown = self.shutdown.clone();
        retry::sleep(jitter(self.timings.initial_delay), &mut shutdown).await?;

        loop {
            let peers = match self.list_peers().await {
                Ok(peers) => peers,
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    tracing::warn!("{}: listing peers failed: {e}", self.settings.domain);
                    retry::sleep(self.timings.retry_backoff, &mut shutdown).await?;
                    continue;
                }
            };

            tracing::info!("{}: {} peers to try", self.settings.domain, peers.len());
            for peer in &peers {
                if *shutdown.borrow() {
                    return Err(ClientError::Shutdown);
                }
                match self.attempt_direct(peer).await {
                    Ok(()) => tracing::info!(
                        domain = %self.settings.domain,
                        peer = %peer.peer_id,
                        nick = %peer.nick,
                        "direct connection established"
                    ),
                    Err(e) => tracing::warn!(
                        domain = %self.settings.domain,
                        peer = %peer.peer_id,
                        nick = %peer.nick,
                        error = %e,
                        "direct connection failed"
                    ),
                }
            }

            retry::sleep(jitter(self.timings.round_interval), &mut shutdown).await?;
        }
    }

    /// Every other peer announced in this domain.
    ///
    /// # Errors
    ///
    /// See [`RendezvousClient::list_peers`].
    pub async fn list_peers(&self) -> Result<Vec<PresenceRecord>, ClientError> {
        self.rendezvous.lock().await.list_peers().await
    }

    /// Try to reach `peer` over a direct connection.
    ///
    /// # Errors
    ///
    /// Returns the dial error, or [`ClientError::DirectTimeout`] if only
    /// relayed connections exist after the polling ceiling.
    pub async fn attempt_direct(&self, peer: &PresenceRecord) -> Result<(), ClientError> {
        self.connect_bootstrappers().await;
        tokio::time::sleep(self.timings.settle).await;

        self.host.connect(&peer.addr_info()).await?;

        let checks = poll_direct(
            &peer.peer_id,
            || self.host.connections_to(&peer.peer_id),
            self.timings.poll_interval,
            self.timings.poll_timeout,
        )
        .await?;
        tracing::debug!("Direct connection to {} after {checks} checks", peer.peer_id.short());
        Ok(())
    }
}
