//! DummyAuthenticator - identifier exchange without any proof.
//!
//! The initiator states its identifier; the responder believes it. Only
//! useful for exercising the transport without key material in play.

use std::sync::Arc;
use tracing::debug;

use super::{AuthError, AuthState, AuthStep, Authenticator, AUTH_SUCCESS};
use crate::core_identity::{CryptoIdentity, Identifier};
use crate::serializer::{BincodeSerializer, Serializer};

enum Role {
    Initiator { remote: Identifier },
    Responder { expected: Option<Identifier> },
}

pub struct DummyAuthenticator<S = BincodeSerializer> {
    identity: Arc<CryptoIdentity>,
    role: Role,
    serializer: S,
    state: AuthState,
}

impl<S: Serializer> DummyAuthenticator<S> {
    pub fn initiator(identity: Arc<CryptoIdentity>, remote: Identifier, serializer: S) -> Self {
        Self { identity, role: Role::Initiator { remote }, serializer, state: AuthState::Idle }
    }

    pub fn responder(identity: Arc<CryptoIdentity>, expected: Option<Identifier>, serializer: S) -> Self {
        Self { identity, role: Role::Responder { expected }, serializer, state: AuthState::Idle }
    }

    fn finish(&mut self, result: Result<AuthStep, AuthError>) -> AuthStep {
        match result {
            Ok(step) => {
                self.state = match step {
                    AuthStep::Succeeded { .. } => AuthState::Succeeded,
                    _ => AuthState::AwaitingPeer,
                };
                step
            }
            Err(e) => {
                self.state = AuthState::Failed;
                AuthStep::Failed(e)
            }
        }
    }
}

impl<S: Serializer> Authenticator for DummyAuthenticator<S> {
    fn start(&mut self) -> AuthStep {
        if self.state != AuthState::Idle {
            return AuthStep::Failed(AuthError::AlreadyFinished);
        }
        let result = match &self.role {
            Role::Initiator { .. } => self
                .identity
                .identifier()
                .map_err(|e| AuthError::Identity(e.to_string()))
                .and_then(|own| self.serializer.serialize(&own.to_string()).map_err(AuthError::from))
                .map(|frame| AuthStep::Continue { send: Some(frame) }),
            Role::Responder { .. } => Ok(AuthStep::Continue { send: None }),
        };
        self.finish(result)
    }

    fn receive(&mut self, frame: &[u8]) -> AuthStep {
        if self.state != AuthState::AwaitingPeer {
            return AuthStep::Failed(AuthError::AlreadyFinished);
        }
        let result = match &self.role {
            Role::Initiator { remote } => {
                if frame == [AUTH_SUCCESS].as_slice() {
                    Ok(AuthStep::Succeeded { peer: remote.clone(), send: None })
                } else {
                    Err(AuthError::UnexpectedReply)
                }
            }
            Role::Responder { expected } => self
                .serializer
                .deserialize::<String>(frame)
                .map_err(AuthError::from)
                .and_then(|stated| {
                    let peer = Identifier::parse(&stated)
                        .map_err(|e| AuthError::InvalidIdentifier(format!("{stated}: {e}")))?;
                    match expected {
                        Some(expected) if *expected != peer => {
                            Err(AuthError::UnexpectedPeer { expected: expected.clone(), actual: stated })
                        }
                        _ => {
                            debug!(peer = %peer, "Accepted unauthenticated peer");
                            Ok(AuthStep::Succeeded { peer, send: Some(vec![AUTH_SUCCESS]) })
                        }
                    }
                }),
        };
        self.finish(result)
    }

    fn state(&self) -> AuthState {
        self.state
    }
}
