//! Shared-secret challenge-response handshake.
//!
//! Both sides prove knowledge of the secret without sending it. Each proof
//! hashes a salt chosen by the prover together with a nonce chosen by the
//! verifier, so a recorded proof is useless against a fresh nonce. The whole
//! exchange runs under [`IO_DEADLINE`](crate::IO_DEADLINE).

use crate::codec::{MessageStream, Stream};
use crate::error::ProtoError;
use crate::message::FlareMessage;
use crate::IO_DEADLINE;
use flare_crypto::{proof, random, verify};

fn fresh_nonce() -> Result<[u8; 32], ProtoError> {
    random::nonce().map_err(|_| ProtoError::RandomFailed)
}

/// Run the handshake as the side that opened the stream.
///
/// The responder's proof is checked before anything else is sent; on a
/// mismatch this returns [`ProtoError::AuthFailed`] without sending a
/// RESPONSE. The caller owns the stream and must reset it on error.
///
/// # Errors
///
/// Returns [`ProtoError::AuthFailed`] on a proof mismatch,
/// [`ProtoError::UnexpectedMessage`] if the responder answers with anything
/// but CHALLENGE, and I/O or [`ProtoError::Timeout`] errors from the stream.
pub async fn authenticate_initiator<S: Stream>(
    stream: &mut MessageStream<S>,
    secret: &str,
) -> Result<(), ProtoError> {
    stream.set_timeout(IO_DEADLINE);

    let local_nonce = fresh_nonce()?;
    stream
        .write_message(&FlareMessage::Authen { nonce: local_nonce })
        .await?;

    let (responder_proof, responder_salt, responder_nonce) = match stream.read_message().await? {
        FlareMessage::Challenge { proof, salt, nonce } => (proof, salt, nonce),
        other => {
            return Err(ProtoError::UnexpectedMessage {
                expected: "CHALLENGE",
                got: other.kind(),
            });
        }
    };

    if !verify(secret, &responder_salt, &local_nonce, &responder_proof) {
        return Err(ProtoError::AuthFailed);
    }

    let salt = fresh_nonce()?;
    stream
        .write_message(&FlareMessage::Response {
            proof: proof(secret, &salt, &responder_nonce),
            salt,
        })
        .await?;

    stream.clear_deadline();
    Ok(())
}

/// Run the handshake as the side that accepted the stream.
///
/// # Errors
///
/// Returns [`ProtoError::AuthFailed`] if the initiator's proof does not
/// verify, [`ProtoError::UnexpectedMessage`] if the initiator sends
/// anything out of sequence, and I/O or [`ProtoError::Timeout`] errors from
/// the stream.
pub async fn authenticate_responder<S: Stream>(
    stream: &mut MessageStream<S>,
    secret: &str,
) -> Result<(), ProtoError> {
    stream.set_timeout(IO_DEADLINE);

    let initiator_nonce = match stream.read_message().await? {
        FlareMessage::Authen { nonce } => nonce,
        other => {
            return Err(ProtoError::UnexpectedMessage {
                expected: "AUTHEN",
                got: other.kind(),
            });
        }
    };

    let salt = fresh_nonce()?;
    let challenge_nonce = fresh_nonce()?;
    stream
        .write_message(&FlareMessage::Challenge {
            proof: proof(secret, &salt, &initiator_nonce),
            salt,
            nonce: challenge_nonce,
        })
        .await?;

    let (initiator_proof, initiator_salt) = match stream.read_message().await? {
        FlareMessage::Response { proof, salt } => (proof, salt),
        other => {
            return Err(ProtoError::UnexpectedMessage {
                expected: "RESPONSE",
                got: other.kind(),
            });
        }
    };
    stream.clear_deadline();

    if !verify(secret, &initiator_salt, &challenge_nonce, &initiator_proof) {
        return Err(ProtoError::AuthFailed);
    }

    Ok(())
}
