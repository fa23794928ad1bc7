//! # Flare Crypto
//!
//! Cryptographic primitives for the Flare rendezvous protocol.
//!
//! This crate provides:
//! - Salted shared-secret proofs (`SHA-256(salt || secret || nonce)`)
//! - Constant-time proof verification
//! - Secure random nonces and salts
//! - Ed25519 peer identities and self-certifying [`PeerId`]s
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Secret proof | SHA-256 |
//! | Peer identity | Ed25519 |
//! | Peer ID derivation | BLAKE3 |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod constant_time;
pub mod error;
pub mod identity;
pub mod proof;
pub mod random;

pub use error::CryptoError;
pub use identity::{Identity, PeerId};
pub use proof::{Proof, proof, verify};

/// Size of handshake nonces and salts
pub const NONCE_SIZE: usize = 32;

/// Size of a secret proof (SHA-256 output)
pub const PROOF_SIZE: usize = 32;

/// Size of a peer identifier (BLAKE3 output)
pub const PEER_ID_SIZE: usize = 32;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;
