//! Connection lifecycle manager.
//!
//! Tracks every open connection per peer and closes the ones nobody needs:
//! unprotected, carrying no streams, and older than the grace period.
//! Protection is a set of named tags per peer; the peer is exempt while the
//! set is non-empty.

use crate::retry;
use flare_crypto::PeerId;
use flare_transport::{ConnectionId, ConnectionObserver, ManagedConnection};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default minimum age before an idle connection may be closed
pub const GRACE_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Default period of the background trim cycle
pub const TRIM_INTERVAL: Duration = Duration::from_secs(60);

struct ConnectionRecord {
    conn: Arc<dyn ManagedConnection>,
    opened_at: Instant,
}

#[derive(Default)]
struct State {
    protected: HashMap<PeerId, HashSet<String>>,
    peers: HashMap<PeerId, HashMap<ConnectionId, ConnectionRecord>>,
}

/// Protects in-use connections and trims idle ones
pub struct ConnManager {
    state: Mutex<State>,
    grace_period: Duration,
}

impl std::fmt::Debug for ConnManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnManager")
            .field("peers", &state.peers.len())
            .field("protected", &state.protected.len())
            .field("grace_period", &self.grace_period)
            .finish()
    }
}

impl Default for ConnManager {
    fn default() -> Self {
        Self::new(GRACE_PERIOD)
    }
}

impl ConnManager {
    /// Create a manager with the given grace period
    #[must_use]
    pub fn new(grace_period: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            grace_period,
        }
    }

    /// Add `tag` to the peer's protection set
    pub fn protect(&self, peer: &PeerId, tag: &str) {
        self.state
            .lock()
            .protected
            .entry(*peer)
            .or_default()
            .insert(tag.to_string());
    }

    /// Remove `tag` from the peer's protection set. Returns whether any
    /// protection remains.
    pub fn unprotect(&self, peer: &PeerId, tag: &str) -> bool {
        let mut state = self.state.lock();
        let Some(tags) = state.protected.get_mut(peer) else {
            return false;
        };
        tags.remove(tag);
        if tags.is_empty() {
            state.protected.remove(peer);
            false
        } else {
            true
        }
    }

    /// Whether the peer holds `tag`
    #[must_use]
    pub fn is_protected(&self, peer: &PeerId, tag: &str) -> bool {
        self.state
            .lock()
            .protected
            .get(peer)
            .is_some_and(|tags| tags.contains(tag))
    }

    /// Number of tracked connections to `peer`
    #[must_use]
    pub fn connection_count(&self, peer: &PeerId) -> usize {
        self.state.lock().peers.get(peer).map_or(0, HashMap::len)
    }

    /// Close every idle, unprotected connection older than the grace
    /// period. Returns how many were closed.
    pub fn trim(&self) -> usize {
        let now = Instant::now();
        let victims = {
            let mut state = self.state.lock();
            let State { protected, peers } = &mut *state;
            let mut victims = Vec::new();

            for (peer, conns) in peers.iter_mut() {
                if protected.contains_key(peer) {
                    continue;
                }
                conns.retain(|_, record| {
                    let idle = record.conn.open_streams() == 0
                        && now.duration_since(record.opened_at) > self.grace_period;
                    if idle {
                        victims.push(Arc::clone(&record.conn));
                    }
                    !idle
                });
            }
            peers.retain(|_, conns| !conns.is_empty());
            victims
        };

        for conn in &victims {
            tracing::debug!(
                "Trimming idle connection {} to {} at {}",
                conn.id(),
                conn.remote_peer().short(),
                conn.remote_addr()
            );
            if let Err(e) = conn.close() {
                tracing::warn!("Failed to close connection {}: {e}", conn.id());
            }
        }
        victims.len()
    }

    /// Run [`ConnManager::trim`] every `interval` until shutdown
    pub fn spawn_trimmer(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while retry::sleep(interval, &mut shutdown).await.is_ok() {
                let closed = manager.trim();
                if closed > 0 {
                    tracing::debug!("Trimmed {closed} idle connections");
                }
            }
        })
    }
}

impl ConnectionObserver for ConnManager {
    fn connected(&self, conn: Arc<dyn ManagedConnection>) {
        let peer = conn.remote_peer();
        let id = conn.id();
        self.state.lock().peers.entry(peer).or_default().insert(
            id,
            ConnectionRecord {
                conn,
                opened_at: Instant::now(),
            },
        );
    }

    fn disconnected(&self, conn: &dyn ManagedConnection) {
        let peer = conn.remote_peer();
        let mut state = self.state.lock();
        if let Some(conns) = state.peers.get_mut(&peer) {
            conns.remove(&conn.id());
            if conns.is_empty() {
                state.peers.remove(&peer);
            }
        }
    }
}
