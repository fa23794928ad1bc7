//! Rendezvous client.
//!
//! Keeps one authenticated presence session with the daemon and sends both
//! ANNOUNCE and GETPEERS over it. The daemon evicts a peer's records when
//! its session ends, so a lost session is reopened on the next request and
//! the last announcement is replayed before anything else. The daemon also
//! drops sessions that stay silent, which [`RendezvousClient::maybe_keepalive`]
//! prevents by repeating the announcement.

use crate::error::ClientError;
use flare_proto::{
    AddrInfo, Domain, FlareMessage, IO_DEADLINE, MAX_HANDSHAKE_FRAME, MAX_PEERLIST_FRAME,
    MessageStream, PROTOCOL_ID, PeerAddr, PresenceRecord, ProtoError, Stream,
    authenticate_initiator,
};
use flare_transport::Host;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use zeroize::Zeroizing;

/// Authenticated client of the rendezvous daemon for one domain
pub struct RendezvousClient<H: Host> {
    host: Arc<H>,
    server: AddrInfo,
    domain: Domain,
    secret: Zeroizing<String>,
    session: Option<MessageStream<H::Stream>>,
    last_announce: Option<FlareMessage>,
    last_sent: Instant,
}

impl<H: Host> std::fmt::Debug for RendezvousClient<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousClient")
            .field("server", &self.server)
            .field("domain", &self.domain)
            .field("connected", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

async fn send<S: Stream>(stream: &mut MessageStream<S>, msg: &FlareMessage) -> Result<(), ProtoError> {
    stream.set_timeout(IO_DEADLINE);
    stream.write_message(msg).await?;
    stream.clear_deadline();
    Ok(())
}

async fn get_peers<S: Stream>(
    stream: &mut MessageStream<S>,
    domain: &Domain,
) -> Result<Vec<PresenceRecord>, ProtoError> {
    stream.set_timeout(IO_DEADLINE);
    stream
        .write_message(&FlareMessage::GetPeers {
            domain: domain.to_string(),
        })
        .await?;

    stream.set_max_frame(MAX_PEERLIST_FRAME);
    let reply = stream.read_message().await;
    stream.set_max_frame(MAX_HANDSHAKE_FRAME);
    stream.clear_deadline();

    match reply? {
        FlareMessage::PeerList { peers } => peers.into_iter().map(PresenceRecord::try_from).collect(),
        other => Err(ProtoError::UnexpectedMessage {
            expected: "PEERLIST",
            got: other.kind(),
        }),
    }
}

impl<H: Host> RendezvousClient<H> {
    /// Create a client for `domain` at `server`. Nothing is dialed until
    /// the first request.
    pub fn new(host: Arc<H>, server: AddrInfo, domain: Domain, secret: impl Into<String>) -> Self {
        Self {
            host,
            server,
            domain,
            secret: Zeroizing::new(secret.into()),
            session: None,
            last_announce: None,
            last_sent: Instant::now(),
        }
    }

    /// Whether a session is currently open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn open_session(&self) -> Result<MessageStream<H::Stream>, ClientError> {
        self.host.connect(&self.server).await?;
        let stream = self.host.open_stream(&self.server.id, PROTOCOL_ID).await?;
        let mut stream = MessageStream::new(stream, MAX_HANDSHAKE_FRAME);

        if let Err(e) = authenticate_initiator(&mut stream, &self.secret).await {
            if matches!(e, ProtoError::AuthFailed) {
                tracing::error!("Authentication failure against {}", self.server.id.short());
            }
            stream.reset();
            return Err(e.into());
        }
        tracing::debug!("Presence session open with {} ({})", self.server.id.short(), self.domain);

        if let Some(announce) = &self.last_announce {
            if let Err(e) = send(&mut stream, announce).await {
                stream.reset();
                return Err(e.into());
            }
        }
        Ok(stream)
    }

    async fn session(&mut self) -> Result<&mut MessageStream<H::Stream>, ClientError> {
        let stream = match self.session.take() {
            Some(stream) => stream,
            None => self.open_session().await?,
        };
        Ok(self.session.insert(stream))
    }

    /// Reset the session if `result` failed
    fn check<T>(&mut self, result: Result<T, ProtoError>) -> Result<T, ClientError> {
        match &result {
            Ok(_) => self.last_sent = Instant::now(),
            Err(_) => {
                if let Some(stream) = self.session.take() {
                    stream.reset();
                }
            }
        }
        result.map_err(ClientError::from)
    }

    /// Announce this host in the domain under `nick`, reachable at `addrs`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be opened or the write fails;
    /// the session is reset in the latter case.
    pub async fn announce(&mut self, nick: &str, addrs: Vec<PeerAddr>) -> Result<(), ClientError> {
        let record = PresenceRecord {
            nick: nick.to_string(),
            peer_id: self.host.local_peer_id(),
            addrs,
        };
        let msg = FlareMessage::Announce {
            domain: self.domain.to_string(),
            peer_info: record.to_peer_info(),
        };

        let stream = self.session().await?;
        let result = send(stream, &msg).await;
        self.check(result)?;
        self.last_announce = Some(msg);
        Ok(())
    }

    /// Every other peer registered in the domain.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be opened, the exchange times
    /// out, or the daemon's reply is malformed; the session is reset in the
    /// latter cases.
    pub async fn list_peers(&mut self) -> Result<Vec<PresenceRecord>, ClientError> {
        let domain = self.domain.clone();
        let stream = self.session().await?;
        let result = get_peers(stream, &domain).await;
        self.check(result)
    }

    /// Repeat the last announcement if nothing has been sent for `idle`,
    /// reopening the session first if it was lost. Returns whether anything
    /// was sent. Before the first announcement there is nothing for the
    /// daemon to keep.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be reopened or the write
    /// fails; the session is reset in the latter case.
    pub async fn maybe_keepalive(&mut self, idle: Duration) -> Result<bool, ClientError> {
        let Some(announce) = self.last_announce.clone() else {
            return Ok(false);
        };
        if self.session.is_some() && self.last_sent.elapsed() < idle {
            return Ok(false);
        }

        if self.session.is_none() {
            // Opening a session replays the announcement
            self.session().await?;
            self.last_sent = Instant::now();
        } else {
            let stream = self.session().await?;
            let result = send(stream, &announce).await;
            self.check(result)?;
        }
        tracing::trace!("Keepalive sent to {}", self.server.id.short());
        Ok(true)
    }

    /// End the session gracefully
    pub async fn close(&mut self) {
        if let Some(stream) = self.session.take() {
            if let Err(e) = stream.close().await {
                tracing::debug!("Closing presence session: {e}");
            }
        }
    }
}
