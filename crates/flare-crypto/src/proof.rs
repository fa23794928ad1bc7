//! Salted shared-secret proofs.
//!
//! A proof binds a salt chosen by the prover, the shared secret, and a nonce
//! chosen by the verifier: `SHA-256(salt || secret || nonce)`. Because the
//! verifier's nonce is inside the hash, a proof captured from one handshake
//! does not verify against any other nonce.

use crate::PROOF_SIZE;
use crate::constant_time::verify_32;
use sha2::{Digest, Sha256};

/// A secret proof (SHA-256 output)
pub type Proof = [u8; PROOF_SIZE];

/// Compute the proof of knowledge of `secret` for the given salt and nonce.
#[must_use]
pub fn proof(secret: &str, salt: &[u8; 32], nonce: &[u8; 32]) -> Proof {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(secret.as_bytes());
    hasher.update(nonce);
    hasher.finalize().into()
}

/// Check a peer-supplied proof in constant time.
#[must_use]
pub fn verify(secret: &str, salt: &[u8; 32], nonce: &[u8; 32], claimed: &Proof) -> bool {
    let expected = proof(secret, salt, nonce);
    verify_32(&expected, claimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_proof_is_deterministic() {
        let salt = [1u8; 32];
        let nonce = [2u8; 32];
        assert_eq!(proof("s3cret", &salt, &nonce), proof("s3cret", &salt, &nonce));
    }

    #[test]
    fn test_proof_matches_sha256_layout() {
        let salt = [0xaa; 32];
        let nonce = [0xbb; 32];

        let mut blob = Vec::new();
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(b"secret");
        blob.extend_from_slice(&nonce);
        let expected: [u8; 32] = Sha256::digest(&blob).into();

        assert_eq!(proof("secret", &salt, &nonce), expected);
    }

    #[test]
    fn test_proof_binds_nonce() {
        let salt = [3u8; 32];
        let p = proof("secret", &salt, &[4u8; 32]);
        assert!(!verify("secret", &salt, &[5u8; 32], &p));
    }

    #[test]
    fn test_proof_binds_salt() {
        let nonce = [6u8; 32];
        let p = proof("secret", &[7u8; 32], &nonce);
        assert!(!verify("secret", &[8u8; 32], &nonce, &p));
    }

    proptest! {
        #[test]
        fn prop_verify_accepts_own_proof(
            secret in ".*",
            salt in any::<[u8; 32]>(),
            nonce in any::<[u8; 32]>(),
        ) {
            let p = proof(&secret, &salt, &nonce);
            prop_assert!(verify(&secret, &salt, &nonce, &p));
        }

        #[test]
        fn prop_verify_rejects_other_secret(
            k1 in "[a-z0-9]{1,32}",
            k2 in "[a-z0-9]{1,32}",
            salt in any::<[u8; 32]>(),
            nonce in any::<[u8; 32]>(),
        ) {
            prop_assume!(k1 != k2);
            let p = proof(&k2, &salt, &nonce);
            prop_assert!(!verify(&k1, &salt, &nonce, &p));
        }
    }
}
