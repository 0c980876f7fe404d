//! CryptoIdentity
//!
//! Holds the node's Ed25519 signing key. The key is loaded at most once and
//! is immutable afterwards; signing before a key is loaded is an error.
//!
//! Security: the signing key zeroizes itself on drop (ed25519-dalek `zeroize`
//! feature) and seed buffers read from disk are wrapped in `Zeroizing`.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::Rng;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::identifier::{Identifier, IdentifierError, PUBLIC_KEY_LEN};

/// Length of an Ed25519 signature
pub const SIGNATURE_LEN: usize = 64;

/// Length of the secret seed stored in key files
pub const SEED_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("No signing key has been loaded")]
    NoKey,

    #[error("A signing key is already loaded")]
    KeyAlreadyLoaded,

    #[error("Key file {path} must hold exactly {SEED_LEN} bytes, found {found}")]
    InvalidKeyFile { path: String, found: usize },

    #[error("Key file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}

/// Signing identity of the local node
#[derive(Default)]
pub struct CryptoIdentity {
    signing_key: OnceLock<SigningKey>,
}

impl CryptoIdentity {
    /// Create a verify-only helper; call [`load_key`](Self::load_key) before signing
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a helper with a freshly generated key
    pub fn generate() -> Self {
        let seed = Zeroizing::new(rand::rng().random::<[u8; SEED_LEN]>());
        Self::from_seed(&seed)
    }

    /// Create a helper from a 32-byte secret seed
    pub fn from_seed(seed: &[u8; SEED_LEN]) -> Self {
        let identity = Self::new();
        // A fresh OnceLock always accepts the first value
        let _ = identity.signing_key.set(SigningKey::from_bytes(seed));
        identity
    }

    /// Load the signing key. Fails if a key was already loaded.
    pub fn load_key(&self, seed: &[u8; SEED_LEN]) -> Result<(), CryptoError> {
        self.signing_key
            .set(SigningKey::from_bytes(seed))
            .map_err(|_| CryptoError::KeyAlreadyLoaded)
    }

    /// Read the seed from `path`, or generate one and write it there if the file is absent
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let path = path.as_ref();

        if path.exists() {
            let bytes = Zeroizing::new(std::fs::read(path)?);
            let seed: Zeroizing<[u8; SEED_LEN]> =
                Zeroizing::new(bytes.as_slice().try_into().map_err(|_| {
                    CryptoError::InvalidKeyFile {
                        path: path.display().to_string(),
                        found: bytes.len(),
                    }
                })?);
            debug!(path = %path.display(), "Loaded identity key");
            return Ok(Self::from_seed(&seed));
        }

        let seed = Zeroizing::new(rand::rng().random::<[u8; SEED_LEN]>());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, seed.as_slice())?;
        info!(path = %path.display(), "Generated new identity key");
        Ok(Self::from_seed(&seed))
    }

    pub fn has_key(&self) -> bool {
        self.signing_key.get().is_some()
    }

    fn key(&self) -> Result<&SigningKey, CryptoError> {
        self.signing_key.get().ok_or(CryptoError::NoKey)
    }

    /// Sign `message`, returning a 64-byte signature
    pub fn sign(&self, message: &[u8]) -> Result<[u8; SIGNATURE_LEN], CryptoError> {
        Ok(self.key()?.sign(message).to_bytes())
    }

    /// Verify `signature` over `message` under `public_key`.
    /// Malformed keys or signatures verify as false.
    pub fn verify(message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; PUBLIC_KEY_LEN]>::try_from(public_key) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        verifying_key.verify(message, &signature).is_ok()
    }

    pub fn public_key(&self) -> Result<[u8; PUBLIC_KEY_LEN], CryptoError> {
        Ok(self.key()?.verifying_key().to_bytes())
    }

    /// The identifier this node is reachable under
    pub fn identifier(&self) -> Result<Identifier, CryptoError> {
        Ok(Self::derive_identifier(&self.public_key()?)?)
    }

    /// Derive the self-certifying identifier of any public key
    pub fn derive_identifier(public_key: &[u8]) -> Result<Identifier, IdentifierError> {
        Identifier::from_public_key(public_key)
    }
}

impl fmt::Debug for CryptoIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoIdentity")
            .field(
                "public",
                &self.signing_key.get().map(|k| hex::encode(k.verifying_key().as_bytes())),
            )
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let identity = CryptoIdentity::generate();
        let sig = identity.sign(b"hello").unwrap();
        let pk = identity.public_key().unwrap();
        assert!(CryptoIdentity::verify(b"hello", &sig, &pk));
        assert!(!CryptoIdentity::verify(b"hellp", &sig, &pk));
    }

    #[test]
    fn test_signing_is_deterministic() {
        let identity = CryptoIdentity::from_seed(&[9u8; 32]);
        assert_eq!(identity.sign(b"m").unwrap(), identity.sign(b"m").unwrap());
    }

    #[test]
    fn test_sign_without_key_fails() {
        let identity = CryptoIdentity::new();
        assert!(!identity.has_key());
        assert!(matches!(identity.sign(b"x"), Err(CryptoError::NoKey)));
        assert!(matches!(identity.identifier(), Err(CryptoError::NoKey)));
    }

    #[test]
    fn test_key_loads_once() {
        let identity = CryptoIdentity::new();
        identity.load_key(&[1u8; 32]).unwrap();
        let first = identity.public_key().unwrap();
        assert!(matches!(identity.load_key(&[2u8; 32]), Err(CryptoError::KeyAlreadyLoaded)));
        assert_eq!(identity.public_key().unwrap(), first);
    }

    #[test]
    fn test_verify_rejects_malformed_inputs() {
        let identity = CryptoIdentity::generate();
        let sig = identity.sign(b"m").unwrap();
        let pk = identity.public_key().unwrap();
        assert!(!CryptoIdentity::verify(b"m", &sig[..63], &pk));
        assert!(!CryptoIdentity::verify(b"m", &sig, &pk[..31]));
    }

    #[test]
    fn test_identifier_binds_to_key() {
        let a = CryptoIdentity::generate();
        let b = CryptoIdentity::generate();
        let id_a = a.identifier().unwrap();
        assert_eq!(CryptoIdentity::derive_identifier(&a.public_key().unwrap()).unwrap(), id_a);
        assert_ne!(CryptoIdentity::derive_identifier(&b.public_key().unwrap()).unwrap(), id_a);
        assert_eq!(id_a.public_key(), a.public_key().unwrap());
    }

    #[test]
    fn test_load_or_generate_persists_seed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("identity.key");

        let first = CryptoIdentity::load_or_generate(&path).unwrap();
        let second = CryptoIdentity::load_or_generate(&path).unwrap();
        assert_eq!(first.identifier().unwrap(), second.identifier().unwrap());
    }

    #[test]
    fn test_load_rejects_truncated_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.key");
        std::fs::write(&path, [0u8; 10]).unwrap();
        assert!(matches!(
            CryptoIdentity::load_or_generate(&path),
            Err(CryptoError::InvalidKeyFile { found: 10, .. })
        ));
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let identity = CryptoIdentity::from_seed(&[3u8; 32]);
        let debug = format!("{:?}", identity);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(&hex::encode([3u8; 32])));
    }
}
