//! Ed25519 peer identities.
//!
//! A [`PeerId`] is the BLAKE3 hash of a peer's Ed25519 public key, so anyone
//! holding the public key can check the claim without a directory.

use crate::{CryptoError, ED25519_PUBLIC_KEY_SIZE, ED25519_SIGNATURE_SIZE, PEER_ID_SIZE};
use ed25519_dalek::{Signer, Verifier};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Self-certifying peer identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    /// Derive the identifier of a public key
    #[must_use]
    pub fn from_public_key(public_key: &[u8; ED25519_PUBLIC_KEY_SIZE]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    /// Parse identity bytes received from the wire
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPeerIdLength`] unless `bytes` is exactly
    /// 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let id: [u8; PEER_ID_SIZE] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidPeerIdLength {
                    expected: PEER_ID_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self(id))
    }

    /// Raw identifier bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    /// Abbreviated form for log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl From<[u8; PEER_ID_SIZE]> for PeerId {
    fn from(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidPeerIdEncoding(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

/// A peer's long-term signing identity
pub struct Identity {
    signing_key: ed25519_dalek::SigningKey,
}

impl Identity {
    /// Generate an ephemeral identity
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild an identity from its 32-byte secret seed
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    /// Load the identity stored at `path`, generating and persisting a new
    /// one if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or is not a
    /// 32-byte key, or if a new key cannot be written.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            return Self::load(path);
        }

        tracing::info!("Generating peer identity in {}", path.display());
        let identity = Self::generate();
        identity.save(path)?;
        Ok(identity)
    }

    /// Load an identity key file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a 32-byte key.
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(fs::read(path)?);
        let seed: Zeroizing<[u8; 32]> = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyFile {
                path: path.display().to_string(),
                reason: format!("expected 32 bytes, got {}", bytes.len()),
            })
            .map(Zeroizing::new)?;
        Ok(Self::from_seed(&seed))
    }

    /// Write the secret seed to `path`, readable by the owner only
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o400);
        }

        let mut file = options.open(path)?;
        file.write_all(Zeroizing::new(self.signing_key.to_bytes()).as_slice())?;
        Ok(())
    }

    /// This identity's peer identifier
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key())
    }

    /// Raw Ed25519 public key
    #[must_use]
    pub fn public_key(&self) -> [u8; ED25519_PUBLIC_KEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; ED25519_SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Verify a signature made by `public_key`.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPublicKey`] if the key bytes are not a valid
/// curve point, or [`CryptoError::InvalidSignature`] if the signature is
/// malformed or does not verify.
pub fn verify_signature(
    public_key: &[u8; ED25519_PUBLIC_KEY_SIZE],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let key = ed25519_dalek::VerifyingKey::from_bytes(public_key)
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let signature =
        ed25519_dalek::Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
    key.verify(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}
