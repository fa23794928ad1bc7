//! Presence directory.
//!
//! Records live in per-domain maps keyed by peer identity. A record exists
//! only while its owner's session is open: sessions are represented by
//! [`SessionGuard`], and dropping the guard evicts every record the
//! identity registered. One identity holds at most one session; a second
//! session is refused while the first is alive.
//!
//! Every operation is a short critical section under a single lock. No I/O
//! happens while it is held.

use crate::error::DirectoryError;
use flare_crypto::PeerId;
use flare_proto::{Domain, PresenceRecord};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Default)]
struct DirectoryState {
    domains: HashMap<Domain, HashMap<PeerId, PresenceRecord>>,
    sessions: HashSet<PeerId>,
}

impl DirectoryState {
    fn evict(&mut self, peer: &PeerId) {
        self.domains.retain(|_, peers| {
            peers.remove(peer);
            !peers.is_empty()
        });
    }
}

/// Server-resident table of reachable peers
#[derive(Debug, Default)]
pub struct PresenceDirectory {
    state: Mutex<DirectoryState>,
}

impl PresenceDirectory {
    /// Create an empty directory
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a session for an authenticated identity.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::DuplicateSession`] if the identity already
    /// has a live session.
    pub fn register_session(self: &Arc<Self>, peer: PeerId) -> Result<SessionGuard, DirectoryError> {
        let mut state = self.state.lock();
        if !state.sessions.insert(peer) {
            return Err(DirectoryError::DuplicateSession(peer));
        }
        Ok(SessionGuard {
            directory: Arc::clone(self),
            peer,
        })
    }

    /// Register or overwrite `record` in `domain` on behalf of the
    /// authenticated identity `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::IdentityMismatch`] if the record names a
    /// different identity.
    pub fn announce(
        &self,
        peer: &PeerId,
        domain: Domain,
        record: PresenceRecord,
    ) -> Result<(), DirectoryError> {
        if record.peer_id != *peer {
            return Err(DirectoryError::IdentityMismatch {
                authenticated: *peer,
                announced: record.peer_id,
            });
        }
        self.state
            .lock()
            .domains
            .entry(domain)
            .or_default()
            .insert(*peer, record);
        Ok(())
    }

    /// Every record in `domain` except the requester's own
    #[must_use]
    pub fn list(&self, domain: &Domain, requester: &PeerId) -> Vec<PresenceRecord> {
        let state = self.state.lock();
        state
            .domains
            .get(domain)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|(id, _)| *id != requester)
                    .map(|(_, record)| record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop every record `peer` registered, in every domain
    pub fn remove(&self, peer: &PeerId) {
        self.state.lock().evict(peer);
    }

    /// Number of open sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    fn end_session(&self, peer: &PeerId) {
        let mut state = self.state.lock();
        state.sessions.remove(peer);
        state.evict(peer);
    }
}

/// An open presence session. Dropping it evicts the identity's records.
#[derive(Debug)]
pub struct SessionGuard {
    directory: Arc<PresenceDirectory>,
    peer: PeerId,
}

impl SessionGuard {
    /// Identity that owns the session
    #[must_use]
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Announce on behalf of this session
    ///
    /// # Errors
    ///
    /// See [`PresenceDirectory::announce`].
    pub fn announce(&self, domain: Domain, record: PresenceRecord) -> Result<(), DirectoryError> {
        self.directory.announce(&self.peer, domain, record)
    }

    /// List `domain` as seen by this session
    #[must_use]
    pub fn list(&self, domain: &Domain) -> Vec<PresenceRecord> {
        self.directory.list(domain, &self.peer)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.directory.end_session(&self.peer);
        tracing::debug!("Session for {} ended, records evicted", self.peer.short());
    }
}
