//! Identity management module
//!
//! API that we expose:
//! - `Identifier` -> validated self-certifying peer address (`<base32>.onion`)
//! - `CryptoIdentity` -> the node's signing key, signature checks, identifier derivation

mod base32;
mod crypto;
mod identifier;

pub use crypto::{CryptoError, CryptoIdentity, SEED_LEN, SIGNATURE_LEN};
pub use identifier::{
    Identifier, IdentifierError, ENCODED_LEN, IDENTIFIER_SUFFIX, IDENTIFIER_VERSION, PUBLIC_KEY_LEN,
};
