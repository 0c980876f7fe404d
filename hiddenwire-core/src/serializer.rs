//! Object-to-bytes marshalling used by the handshake protocols.
//!
//! The transport only needs an opaque `serialize`/`deserialize` capability;
//! `BincodeSerializer` is the default implementation.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Failed to encode value: {0}")]
    Encode(String),

    #[error("Failed to decode bytes: {0}")]
    Decode(String),
}

pub trait Serializer: Send + Sync {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, DecodeError>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, DecodeError>;
}

/// bincode with a hard cap on the decoded size
#[derive(Debug, Clone, Copy)]
pub struct BincodeSerializer {
    limit: u64,
}

impl BincodeSerializer {
    pub fn new(limit: u64) -> Self {
        Self { limit }
    }
}

impl Default for BincodeSerializer {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl Serializer for BincodeSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, DecodeError> {
        use bincode::Options;
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_limit(self.limit)
            .serialize(value)
            .map_err(|e| DecodeError::Encode(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, DecodeError> {
        use bincode::Options;
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_limit(self.limit)
            .reject_trailing_bytes()
            .deserialize(bytes)
            .map_err(|e| DecodeError::Decode(e.to_string()))
    }
}
