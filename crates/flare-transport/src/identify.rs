//! Mutual identification of a freshly opened TCP socket.
//!
//! Both sides send their Ed25519 public key and a random nonce, then sign
//! the other side's nonce. The dialer finishes by naming the protocol the
//! socket will carry (zero length for a bare connection).
//!
//! ```text
//! pubkey (32) | nonce (32)        ->  <- pubkey (32) | nonce (32)
//! sig(CONTEXT || peer_nonce) (64) ->  <- sig(CONTEXT || peer_nonce) (64)
//! len (u16 BE) | protocol         ->
//! ```

use crate::error::TransportError;
use flare_crypto::identity::verify_signature;
use flare_crypto::{ED25519_PUBLIC_KEY_SIZE, ED25519_SIGNATURE_SIZE, Identity, NONCE_SIZE, PeerId, random};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Domain separation for identification signatures
const CONTEXT: &[u8] = b"flare-identify-v1";

/// Longest protocol name accepted
const MAX_PROTOCOL_LEN: usize = 256;

fn signed_message(peer_nonce: &[u8; NONCE_SIZE]) -> Vec<u8> {
    let mut message = Vec::with_capacity(CONTEXT.len() + NONCE_SIZE);
    message.extend_from_slice(CONTEXT);
    message.extend_from_slice(peer_nonce);
    message
}

/// Exchange keys and signatures, returning the proven remote identity
async fn exchange<S>(sock: &mut S, identity: &Identity) -> Result<PeerId, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce = random::nonce().map_err(|e| TransportError::Identify(e.to_string()))?;

    let mut hello = [0u8; ED25519_PUBLIC_KEY_SIZE + NONCE_SIZE];
    hello[..ED25519_PUBLIC_KEY_SIZE].copy_from_slice(&identity.public_key());
    hello[ED25519_PUBLIC_KEY_SIZE..].copy_from_slice(&nonce);
    sock.write_all(&hello).await?;
    sock.flush().await?;

    let mut remote_hello = [0u8; ED25519_PUBLIC_KEY_SIZE + NONCE_SIZE];
    sock.read_exact(&mut remote_hello).await?;
    let mut remote_key = [0u8; ED25519_PUBLIC_KEY_SIZE];
    remote_key.copy_from_slice(&remote_hello[..ED25519_PUBLIC_KEY_SIZE]);
    let mut remote_nonce = [0u8; NONCE_SIZE];
    remote_nonce.copy_from_slice(&remote_hello[ED25519_PUBLIC_KEY_SIZE..]);

    sock.write_all(&identity.sign(&signed_message(&remote_nonce)))
        .await?;
    sock.flush().await?;

    let mut signature = [0u8; ED25519_SIGNATURE_SIZE];
    sock.read_exact(&mut signature).await?;
    verify_signature(&remote_key, &signed_message(&nonce), &signature)
        .map_err(|e| TransportError::Identify(e.to_string()))?;

    Ok(PeerId::from_public_key(&remote_key))
}

/// Identify an outbound socket.
///
/// Fails with [`TransportError::PeerIdMismatch`] when `expected` is given and
/// the remote proves a different identity.
///
/// # Errors
///
/// Returns an error on I/O failure, a bad signature, or an identity
/// mismatch.
pub async fn identify_outbound<S>(
    sock: &mut S,
    identity: &Identity,
    expected: Option<&PeerId>,
    protocol: Option<&str>,
) -> Result<PeerId, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = exchange(sock, identity).await?;
    if let Some(expected) = expected {
        if *expected != remote {
            return Err(TransportError::PeerIdMismatch {
                expected: *expected,
                actual: remote,
            });
        }
    }

    let protocol = protocol.unwrap_or_default().as_bytes();
    if protocol.len() > MAX_PROTOCOL_LEN {
        return Err(TransportError::Identify("protocol name too long".to_string()));
    }
    // Bounded above, fits in u16
    let len = protocol.len() as u16;
    sock.write_all(&len.to_be_bytes()).await?;
    sock.write_all(protocol).await?;
    sock.flush().await?;

    Ok(remote)
}

/// Identify an inbound socket, returning the remote identity and the
/// protocol it asked for (`None` for a bare connection).
///
/// # Errors
///
/// Returns an error on I/O failure, a bad signature, or a malformed
/// protocol selection.
pub async fn identify_inbound<S>(
    sock: &mut S,
    identity: &Identity,
) -> Result<(PeerId, Option<String>), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = exchange(sock, identity).await?;

    let mut len = [0u8; 2];
    sock.read_exact(&mut len).await?;
    let len = usize::from(u16::from_be_bytes(len));
    if len > MAX_PROTOCOL_LEN {
        return Err(TransportError::Identify(format!(
            "protocol name of {len} bytes"
        )));
    }
    if len == 0 {
        return Ok((remote, None));
    }

    let mut protocol = vec![0u8; len];
    sock.read_exact(&mut protocol).await?;
    let protocol = String::from_utf8(protocol)
        .map_err(|_| TransportError::Identify("protocol name is not UTF-8".to_string()))?;
    Ok((remote, Some(protocol)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mutual_identification() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let (mut a, mut b) = tokio::io::duplex(1024);

        let bob_id = bob.peer_id();
        let (out, inb) = tokio::join!(
            identify_outbound(&mut a, &alice, Some(&bob_id), Some("/flare/presence/1.0.0")),
            identify_inbound(&mut b, &bob),
        );

        assert_eq!(out.unwrap(), bob.peer_id());
        let (remote, protocol) = inb.unwrap();
        assert_eq!(remote, alice.peer_id());
        assert_eq!(protocol.as_deref(), Some("/flare/presence/1.0.0"));
    }

    #[tokio::test]
    async fn test_bare_connection() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let (mut a, mut b) = tokio::io::duplex(1024);

        let (out, inb) = tokio::join!(
            identify_outbound(&mut a, &alice, None, None),
            identify_inbound(&mut b, &bob),
        );

        assert_eq!(out.unwrap(), bob.peer_id());
        assert_eq!(inb.unwrap(), (alice.peer_id(), None));
    }

    #[tokio::test]
    async fn test_unexpected_identity() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mallory = Identity::generate();
        let (mut a, mut b) = tokio::io::duplex(1024);

        let expected = bob.peer_id();
        let (out, inb) = tokio::join!(
            async {
                let res = identify_outbound(&mut a, &alice, Some(&expected), None).await;
                drop(a);
                res
            },
            identify_inbound(&mut b, &mallory),
        );

        assert!(matches!(out, Err(TransportError::PeerIdMismatch { .. })));
        // Dialer hung up before selecting a protocol
        assert!(inb.is_err());
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let bob = Identity::generate();
        let (mut a, mut b) = tokio::io::duplex(1024);

        let forger = async {
            let impostor = Identity::generate();
            let mut hello = [0u8; 64];
            hello[..32].copy_from_slice(&impostor.public_key());
            a.write_all(&hello).await.unwrap();
            let mut theirs = [0u8; 64];
            a.read_exact(&mut theirs).await.unwrap();
            a.write_all(&[0u8; 64]).await.unwrap();
            let mut sig = [0u8; 64];
            a.read_exact(&mut sig).await.unwrap();
        };

        let (_, inb) = tokio::join!(forger, identify_inbound(&mut b, &bob));
        assert!(matches!(inb, Err(TransportError::Identify(_))));
    }
}
