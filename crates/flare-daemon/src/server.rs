//! Per-session protocol loop.

use crate::directory::PresenceDirectory;
use crate::error::DaemonError;
use flare_crypto::PeerId;
use flare_proto::{
    Domain, FlareMessage, IO_DEADLINE, MAX_HANDSHAKE_FRAME, MessageStream, PresenceRecord,
    ProtoError, SESSION_IDLE_TIMEOUT, Stream, authenticate_responder,
};
use std::sync::Arc;
use zeroize::Zeroizing;

/// The rendezvous server
pub struct Daemon {
    secret: Zeroizing<String>,
    directory: Arc<PresenceDirectory>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("sessions", &self.directory.session_count())
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Create a daemon with an empty directory
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self::with_directory(secret, PresenceDirectory::new())
    }

    /// Create a daemon serving an existing directory
    #[must_use]
    pub fn with_directory(secret: impl Into<String>, directory: Arc<PresenceDirectory>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
            directory,
        }
    }

    /// The directory this daemon serves
    #[must_use]
    pub fn directory(&self) -> &Arc<PresenceDirectory> {
        &self.directory
    }

    /// Serve one presence session from `peer` until it ends.
    ///
    /// A graceful end of stream closes the session normally. Any other
    /// failure, including [`SESSION_IDLE_TIMEOUT`] passing without a
    /// request, resets the stream. Either way the peer's records are gone
    /// once this returns.
    pub async fn handle_stream<S: Stream>(&self, peer: PeerId, stream: S) {
        let mut stream = MessageStream::new(stream, MAX_HANDSHAKE_FRAME);

        match self.serve(peer, &mut stream).await {
            Ok(()) => tracing::debug!("Session with {} closed", peer.short()),
            Err(e) => {
                match &e {
                    DaemonError::Proto(ProtoError::AuthFailed) => {
                        tracing::error!("Authentication failure from {}", peer.short());
                    }
                    DaemonError::Proto(p) if p.is_protocol_violation() => {
                        tracing::warn!("Protocol error from {}: {e}", peer.short());
                    }
                    DaemonError::Directory(_) => {
                        tracing::warn!("Rejected session from {}: {e}", peer.short());
                    }
                    DaemonError::Proto(ProtoError::Timeout) => {
                        tracing::info!("Session with {} went silent, evicting", peer.short());
                    }
                    DaemonError::Proto(_) => {
                        tracing::debug!("Session with {} failed: {e}", peer.short());
                    }
                }
                stream.reset();
            }
        }
    }

    async fn serve<S: Stream>(
        &self,
        peer: PeerId,
        stream: &mut MessageStream<S>,
    ) -> Result<(), DaemonError> {
        authenticate_responder(stream, &self.secret).await?;
        let session = self.directory.register_session(peer)?;
        tracing::info!("Peer {} authenticated", peer.short());

        loop {
            stream.set_timeout(SESSION_IDLE_TIMEOUT);
            let msg = match stream.read_message().await {
                Ok(msg) => msg,
                Err(ProtoError::Closed) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            match msg {
                FlareMessage::Announce { domain, peer_info } => {
                    let record = PresenceRecord::try_from(peer_info)?;
                    tracing::debug!(
                        "Announce from {} ({}) in {domain}: {} addrs",
                        peer.short(),
                        record.nick,
                        record.addrs.len()
                    );
                    session.announce(Domain::new(domain), record)?;
                }
                FlareMessage::GetPeers { domain } => {
                    let peers = session
                        .list(&Domain::new(domain))
                        .iter()
                        .map(PresenceRecord::to_peer_info)
                        .collect();
                    stream.set_timeout(IO_DEADLINE);
                    stream.write_message(&FlareMessage::PeerList { peers }).await?;
                    stream.clear_deadline();
                }
                other => {
                    return Err(ProtoError::UnexpectedMessage {
                        expected: "ANNOUNCE or GETPEERS",
                        got: other.kind(),
                    }
                    .into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flare_crypto::Identity;
    use flare_proto::{MAX_PEERLIST_FRAME, PeerInfo, authenticate_initiator};
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    const SECRET: &str = "correct horse battery staple";

    async fn open_session(
        daemon: &Arc<Daemon>,
        peer: PeerId,
        secret: &str,
    ) -> (MessageStream<DuplexStream>, JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let daemon = Arc::clone(daemon);
        let handle = tokio::spawn(async move { daemon.handle_stream(peer, server).await });
        let mut stream = MessageStream::new(client, MAX_PEERLIST_FRAME);
        authenticate_initiator(&mut stream, secret).await.unwrap();
        (stream, handle)
    }

    fn info(nick: &str, peer: &PeerId) -> PeerInfo {
        PeerInfo {
            nick: nick.to_string(),
            peer_id: peer.as_bytes().to_vec(),
            addrs: vec![b"/ip4/10.0.0.1/tcp/4001".to_vec()],
        }
    }

    async fn get_peers(stream: &mut MessageStream<DuplexStream>, domain: &str) -> Vec<PeerInfo> {
        stream
            .write_message(&FlareMessage::GetPeers {
                domain: domain.to_string(),
            })
            .await
            .unwrap();
        match stream.read_message().await.unwrap() {
            FlareMessage::PeerList { peers } => peers,
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_announce_then_list() {
        let daemon = Arc::new(Daemon::new(SECRET));
        let alice = Identity::generate().peer_id();
        let bob = Identity::generate().peer_id();

        let (mut a, _ha) = open_session(&daemon, alice, SECRET).await;
        a.write_message(&FlareMessage::Announce {
            domain: "X".to_string(),
            peer_info: info("alice", &alice),
        })
        .await
        .unwrap();
        // Requests on one session are served in order
        assert!(get_peers(&mut a, "X").await.is_empty());

        let (mut b, _hb) = open_session(&daemon, bob, SECRET).await;
        assert_eq!(get_peers(&mut b, "X").await, vec![info("alice", &alice)]);
        assert!(get_peers(&mut b, "Y").await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_evicts() {
        let daemon = Arc::new(Daemon::new(SECRET));
        let alice = Identity::generate().peer_id();
        let bob = Identity::generate().peer_id();

        let (mut a, ha) = open_session(&daemon, alice, SECRET).await;
        a.write_message(&FlareMessage::Announce {
            domain: "X".to_string(),
            peer_info: info("alice", &alice),
        })
        .await
        .unwrap();
        get_peers(&mut a, "X").await;

        drop(a);
        ha.await.unwrap();

        let (mut b, _hb) = open_session(&daemon, bob, SECRET).await;
        assert!(get_peers(&mut b, "X").await.is_empty());
    }

    #[tokio::test]
    async fn test_spoofed_identity_resets() {
        let daemon = Arc::new(Daemon::new(SECRET));
        let mallory = Identity::generate().peer_id();
        let alice = Identity::generate().peer_id();

        let (mut m, hm) = open_session(&daemon, mallory, SECRET).await;
        m.write_message(&FlareMessage::Announce {
            domain: "X".to_string(),
            peer_info: info("alice", &alice),
        })
        .await
        .unwrap();
        hm.await.unwrap();

        assert!(m.read_message().await.is_err());
        assert!(daemon.directory().list(&Domain::new("X"), &alice).is_empty());
        assert_eq!(daemon.directory().session_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let daemon = Arc::new(Daemon::new(SECRET));
        let alice = Identity::generate().peer_id();

        let (mut first, _h1) = open_session(&daemon, alice, SECRET).await;
        let (mut second, h2) = open_session(&daemon, alice, SECRET).await;
        h2.await.unwrap();
        assert!(second.read_message().await.is_err());

        // The original session is untouched
        assert!(get_peers(&mut first, "X").await.is_empty());
        assert_eq!(daemon.directory().session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_session_evicted() {
        let daemon = Arc::new(Daemon::new(SECRET));
        let alice = Identity::generate().peer_id();
        let bob = Identity::generate().peer_id();

        let (mut a, ha) = open_session(&daemon, alice, SECRET).await;
        a.write_message(&FlareMessage::Announce {
            domain: "X".to_string(),
            peer_info: info("alice", &alice),
        })
        .await
        .unwrap();
        get_peers(&mut a, "X").await;

        // Alice goes quiet without closing her end
        tokio::time::sleep(SESSION_IDLE_TIMEOUT + Duration::from_secs(1)).await;
        ha.await.unwrap();
        assert_eq!(daemon.directory().session_count(), 0);

        let (mut b, _hb) = open_session(&daemon, bob, SECRET).await;
        assert!(get_peers(&mut b, "X").await.is_empty());

        // The same identity is welcome again
        let (mut again, _h) = open_session(&daemon, alice, SECRET).await;
        assert!(get_peers(&mut again, "X").await.is_empty());
        assert_eq!(daemon.directory().session_count(), 2);
        drop(a);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_keep_session_alive() {
        let daemon = Arc::new(Daemon::new(SECRET));
        let alice = Identity::generate().peer_id();

        let (mut a, _ha) = open_session(&daemon, alice, SECRET).await;
        for _ in 0..3 {
            tokio::time::sleep(SESSION_IDLE_TIMEOUT / 2).await;
            get_peers(&mut a, "X").await;
        }
        assert_eq!(daemon.directory().session_count(), 1);
    }

    #[tokio::test]
    async fn test_out_of_sequence_message_resets() {
        let daemon = Arc::new(Daemon::new(SECRET));
        let alice = Identity::generate().peer_id();

        let (mut a, ha) = open_session(&daemon, alice, SECRET).await;
        a.write_message(&FlareMessage::Authen { nonce: [0u8; 32] })
            .await
            .unwrap();
        ha.await.unwrap();
        assert_eq!(daemon.directory().session_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_secret_never_registers() {
        let daemon = Arc::new(Daemon::new(SECRET));
        let alice = Identity::generate().peer_id();

        let (client, server) = tokio::io::duplex(64 * 1024);
        let d = Arc::clone(&daemon);
        let handle = tokio::spawn(async move { d.handle_stream(alice, server).await });
        let mut stream = MessageStream::new(client, MAX_PEERLIST_FRAME);

        let err = authenticate_initiator(&mut stream, "wrong").await.unwrap_err();
        assert!(matches!(err, ProtoError::AuthFailed));
        drop(stream);
        handle.await.unwrap();
        assert_eq!(daemon.directory().session_count(), 0);
    }
}
