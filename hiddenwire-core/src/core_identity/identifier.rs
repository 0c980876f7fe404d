//! Identifier module
//!
//! Self-certifying peer address: `base32(public_key || checksum || version) + ".onion"`
//! where `checksum = SHA3-256(".onion checksum" || public_key || version)[..2]`.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use super::base32;

/// Address version carried in the last payload byte
pub const IDENTIFIER_VERSION: u8 = 0x03;

/// Network suffix appended to the encoded payload
pub const IDENTIFIER_SUFFIX: &str = ".onion";

/// Length of the Ed25519 public key embedded in an identifier
pub const PUBLIC_KEY_LEN: usize = 32;

const CHECKSUM_PREFIX: &[u8] = b".onion checksum";
const CHECKSUM_LEN: usize = 2;
const PAYLOAD_LEN: usize = PUBLIC_KEY_LEN + CHECKSUM_LEN + 1;

/// Number of base32 characters before the suffix
pub const ENCODED_LEN: usize = 56;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("Identifier must end with {IDENTIFIER_SUFFIX}")]
    MissingSuffix,

    #[error("Identifier must have {ENCODED_LEN} characters before the suffix, got {0}")]
    InvalidLength(usize),

    #[error("Identifier contains characters outside the base32 alphabet")]
    InvalidEncoding,

    #[error("Unsupported identifier version: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("Identifier checksum does not match its public key")]
    ChecksumMismatch,

    #[error("Public key must be {PUBLIC_KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// A validated peer identifier.
///
/// Equality and hashing are by the text form; cloning is cheap.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(Arc<str>);

impl Identifier {
    /// Derive the identifier for an Ed25519 public key
    pub fn from_public_key(public_key: &[u8]) -> Result<Self, IdentifierError> {
        if public_key.len() != PUBLIC_KEY_LEN {
            return Err(IdentifierError::InvalidKeyLength(public_key.len()));
        }

        let mut payload = Vec::with_capacity(PAYLOAD_LEN);
        payload.extend_from_slice(public_key);
        payload.extend_from_slice(&checksum(public_key, IDENTIFIER_VERSION));
        payload.push(IDENTIFIER_VERSION);

        let mut text = base32::encode(&payload);
        text.push_str(IDENTIFIER_SUFFIX);
        Ok(Identifier(text.into()))
    }

    /// Parse and structurally validate the text form (length, alphabet, version, checksum)
    pub fn parse(text: &str) -> Result<Self, IdentifierError> {
        let encoded = text.strip_suffix(IDENTIFIER_SUFFIX).ok_or(IdentifierError::MissingSuffix)?;
        if encoded.len() != ENCODED_LEN {
            return Err(IdentifierError::InvalidLength(encoded.len()));
        }

        let payload = base32::decode(encoded).ok_or(IdentifierError::InvalidEncoding)?;
        if payload.len() != PAYLOAD_LEN {
            return Err(IdentifierError::InvalidEncoding);
        }

        let version = payload[PAYLOAD_LEN - 1];
        if version != IDENTIFIER_VERSION {
            return Err(IdentifierError::UnsupportedVersion(version));
        }

        let (public_key, rest) = payload.split_at(PUBLIC_KEY_LEN);
        if rest[..CHECKSUM_LEN] != checksum(public_key, version) {
            return Err(IdentifierError::ChecksumMismatch);
        }

        Ok(Identifier(text.into()))
    }

    /// Cheap structural check without allocating an `Identifier`
    pub fn is_valid(text: &str) -> bool {
        Self::parse(text).is_ok()
    }

    /// The public key embedded in this identifier
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        let mut key = [0u8; PUBLIC_KEY_LEN];
        // Validated at construction, so decoding cannot fail here
        if let Some(payload) = self.0.strip_suffix(IDENTIFIER_SUFFIX).and_then(base32::decode) {
            key.copy_from_slice(&payload[..PUBLIC_KEY_LEN]);
        }
        key
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First characters of the address, for log lines
    pub fn short(&self) -> &str {
        &self.0[..16]
    }
}

fn checksum(public_key: &[u8], version: u8) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Sha3_256::new();
    hasher.update(CHECKSUM_PREFIX);
    hasher.update(public_key);
    hasher.update([version]);
    let digest = hasher.finalize();
    [digest[0], digest[1]]
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self.0)
    }
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identifier {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.0.to_string()
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
