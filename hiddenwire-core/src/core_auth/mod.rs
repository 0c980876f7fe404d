//! Peer authentication run on every fresh channel before application traffic.
//!
//! An [`Authenticator`] is a small state machine fed with the frames that
//! arrive on its channel. It never touches the socket itself: each step tells
//! the caller what (if anything) to send back and whether the handshake is
//! still running, succeeded with a verified peer, or failed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::config::AuthConfig;
use crate::core_identity::{CryptoIdentity, Identifier};
use crate::serializer::{BincodeSerializer, DecodeError};

pub mod dummy;
pub mod public_key;

pub use dummy::DummyAuthenticator;
pub use public_key::{AuthenticationMessage, PublicKeyAuthenticator};

/// Single-byte frame the responder sends once it accepts the initiator
pub const AUTH_SUCCESS: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("handshake message is missing {0}")]
    MissingField(&'static str),

    #[error("handshake addressed to {0}, not to us")]
    WrongDestination(String),

    #[error("expected peer {expected}, got {actual}")]
    UnexpectedPeer { expected: Identifier, actual: String },

    #[error("timestamp {timestamp} is {skew_ms}ms away from the local clock")]
    StaleTimestamp { timestamp: i64, skew_ms: i64 },

    #[error("source is not a valid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("public key does not derive the claimed identifier {0}")]
    KeyMismatch(String),

    #[error("signature does not verify")]
    BadSignature,

    #[error("malformed handshake message: {0}")]
    Malformed(#[from] DecodeError),

    #[error("unexpected handshake reply")]
    UnexpectedReply,

    #[error("local identity unavailable: {0}")]
    Identity(String),

    #[error("handshake already finished")]
    AlreadyFinished,
}

impl AuthError {
    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::MissingField(_) => "missing_field",
            AuthError::WrongDestination(_) => "wrong_destination",
            AuthError::UnexpectedPeer { .. } => "unexpected_peer",
            AuthError::StaleTimestamp { .. } => "stale_timestamp",
            AuthError::InvalidIdentifier(_) => "invalid_identifier",
            AuthError::KeyMismatch(_) => "key_mismatch",
            AuthError::BadSignature => "bad_signature",
            AuthError::Malformed(_) => "malformed",
            AuthError::UnexpectedReply => "unexpected_reply",
            AuthError::Identity(_) => "identity",
            AuthError::AlreadyFinished => "already_finished",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    AwaitingPeer,
    Succeeded,
    Failed,
}

/// What the channel owner must do after feeding the authenticator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    Continue { send: Option<Vec<u8>> },
    Succeeded { peer: Identifier, send: Option<Vec<u8>> },
    Failed(AuthError),
}

pub trait Authenticator: Send + Sync {
    /// Begin the handshake. Initiators return their opening message.
    fn start(&mut self) -> AuthStep;

    /// Feed one inbound frame
    fn receive(&mut self, frame: &[u8]) -> AuthStep;

    fn state(&self) -> AuthState;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStrategy {
    /// Signed, timestamped proof of key ownership
    #[default]
    PublicKey,
    /// Trust the stated identifier; transport testing only
    Dummy,
}

impl fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthStrategy::PublicKey => "public_key",
            AuthStrategy::Dummy => "dummy",
        })
    }
}

impl FromStr for AuthStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "public_key" | "publickey" => Ok(AuthStrategy::PublicKey),
            "dummy" => Ok(AuthStrategy::Dummy),
            other => Err(format!("unknown authentication strategy '{other}'")),
        }
    }
}

/// Authenticator for a channel we dialled to `remote`.
///
/// The active side always names the peer it dialled, so `remote` is required
/// here; only [`responder`] accepts an unknown peer.
pub fn initiator(config: &AuthConfig, identity: Arc<CryptoIdentity>, remote: Identifier) -> Box<dyn Authenticator> {
    match config.strategy {
        AuthStrategy::PublicKey => Box::new(PublicKeyAuthenticator::initiator(
            identity,
            remote,
            BincodeSerializer::default(),
        )),
        AuthStrategy::Dummy => Box::new(DummyAuthenticator::initiator(identity, remote, BincodeSerializer::default())),
    }
}

/// Authenticator for an accepted channel, optionally pinned to `expected`
pub fn responder(
    config: &AuthConfig,
    identity: Arc<CryptoIdentity>,
    expected: Option<Identifier>,
) -> Box<dyn Authenticator> {
    match config.strategy {
        AuthStrategy::PublicKey => Box::new(
            PublicKeyAuthenticator::responder(identity, expected, BincodeSerializer::default())
                .with_max_clock_skew(config.max_clock_skew),
        ),
        AuthStrategy::Dummy => {
            Box::new(DummyAuthenticator::responder(identity, expected, BincodeSerializer::default()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticators_can_live_in_spawned_tasks() {
        fn assert_thread_safe<T: Send + Sync + ?Sized>() {}
        assert_thread_safe::<dyn Authenticator>();
        assert_thread_safe::<Box<dyn Authenticator>>();
    }

    /// Pump frames between two authenticators until both settle
    fn run(mut initiator: Box<dyn Authenticator>, mut responder: Box<dyn Authenticator>) -> (AuthStep, AuthStep) {
        responder.start();
        let opening = match initiator.start() {
            AuthStep::Continue { send: Some(frame) } => frame,
            other => panic!("initiator did not open: {other:?}"),
        };
        let verdict = responder.receive(&opening);
        let reply = match &verdict {
            AuthStep::Succeeded { send: Some(frame), .. } => frame.clone(),
            _ => return (AuthStep::Continue { send: None }, verdict),
        };
        (initiator.receive(&reply), verdict)
    }

    #[test]
    fn test_both_strategies_complete() {
        for strategy in [AuthStrategy::PublicKey, AuthStrategy::Dummy] {
            let config = AuthConfig { strategy, ..AuthConfig::default() };
            let a = Arc::new(CryptoIdentity::generate());
            let b = Arc::new(CryptoIdentity::generate());
            let ida = a.identifier().unwrap();
            let idb = b.identifier().unwrap();

            let (client, server) = run(initiator(&config, b, ida.clone()), responder(&config, a, None));
            assert_eq!(client, AuthStep::Succeeded { peer: ida, send: None }, "{strategy}");
            assert_eq!(server, AuthStep::Succeeded { peer: idb, send: Some(vec![AUTH_SUCCESS]) }, "{strategy}");
        }
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("public_key".parse(), Ok(AuthStrategy::PublicKey));
        assert_eq!("Public-Key".parse(), Ok(AuthStrategy::PublicKey));
        assert_eq!("dummy".parse(), Ok(AuthStrategy::Dummy));
        assert!("none".parse::<AuthStrategy>().is_err());
        assert_eq!(AuthStrategy::default().to_string(), "public_key");
    }
}
