/*
    PublicKeyAuthenticator - proof that the dialler owns the key behind its identifier

    initiator                                   responder
      | -- AuthenticationMessage --------------> |  validate, in order:
      |    {source, destination, public_key,     |   1. no empty field
      |     timestamp (ms), signature}           |   2. destination == own identifier
      |                                          |   3. source == expected peer (if pinned)
      |                                          |   4. |now - timestamp| <= max clock skew
      |                                          |   5. source parses as an identifier
      |                                          |   6. derive(public_key) == source
      |                                          |   7. signature verifies under public_key
      | <------------------------ [AUTH_SUCCESS] |
    succeeds with the dialled identifier    succeeds with `source`

    The signature covers source || destination || public_key || timestamp (i64 BE).
    The bounded clock skew limits replay without any per-session state.
*/

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use super::{AuthError, AuthState, AuthStep, Authenticator, AUTH_SUCCESS};
use crate::core_identity::{CryptoError, CryptoIdentity, Identifier};
use crate::serializer::{BincodeSerializer, Serializer};

pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Handshake message sent by the initiator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationMessage {
    pub source: String,
    pub destination: String,
    pub public_key: Vec<u8>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub signature: Vec<u8>,
}

impl AuthenticationMessage {
    /// Bytes covered by the signature
    pub fn signing_payload(source: &str, destination: &str, public_key: &[u8], timestamp: i64) -> Vec<u8> {
        let mut payload = Vec::with_capacity(source.len() + destination.len() + public_key.len() + 8);
        payload.extend_from_slice(source.as_bytes());
        payload.extend_from_slice(destination.as_bytes());
        payload.extend_from_slice(public_key);
        payload.extend_from_slice(&timestamp.to_be_bytes());
        payload
    }

    /// Build and sign a message from `identity` to `destination`
    pub fn signed(identity: &CryptoIdentity, destination: &Identifier, timestamp: i64) -> Result<Self, CryptoError> {
        let source = identity.identifier()?.to_string();
        let destination = destination.to_string();
        let public_key = identity.public_key()?.to_vec();
        let signature = identity
            .sign(&Self::signing_payload(&source, &destination, &public_key, timestamp))?
            .to_vec();
        Ok(Self { source, destination, public_key, timestamp, signature })
    }

    fn check_fields(&self) -> Result<(), AuthError> {
        if self.source.is_empty() {
            return Err(AuthError::MissingField("source"));
        }
        if self.destination.is_empty() {
            return Err(AuthError::MissingField("destination"));
        }
        if self.public_key.is_empty() {
            return Err(AuthError::MissingField("public_key"));
        }
        if self.signature.is_empty() {
            return Err(AuthError::MissingField("signature"));
        }
        Ok(())
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

enum Role {
    Initiator { remote: Identifier },
    Responder { expected: Option<Identifier> },
}

pub struct PublicKeyAuthenticator<S = BincodeSerializer> {
    identity: Arc<CryptoIdentity>,
    role: Role,
    serializer: S,
    max_clock_skew: Duration,
    state: AuthState,
}

impl<S: Serializer> PublicKeyAuthenticator<S> {
    /// Active side: sends its proof to `remote` on [`start`](Authenticator::start)
    pub fn initiator(identity: Arc<CryptoIdentity>, remote: Identifier, serializer: S) -> Self {
        Self::with_role(identity, Role::Initiator { remote }, serializer)
    }

    /// Passive side: waits for the peer's proof; `expected` pins the peer
    pub fn responder(identity: Arc<CryptoIdentity>, expected: Option<Identifier>, serializer: S) -> Self {
        Self::with_role(identity, Role::Responder { expected }, serializer)
    }

    fn with_role(identity: Arc<CryptoIdentity>, role: Role, serializer: S) -> Self {
        Self { identity, role, serializer, max_clock_skew: DEFAULT_MAX_CLOCK_SKEW, state: AuthState::Idle }
    }

    pub fn with_max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = skew;
        self
    }

    fn fail(&mut self, error: AuthError) -> AuthStep {
        self.state = AuthState::Failed;
        AuthStep::Failed(error)
    }

    fn validate(&self, message: &AuthenticationMessage, expected: Option<&Identifier>) -> Result<Identifier, AuthError> {
        message.check_fields()?;

        let own = self.identity.identifier().map_err(|e| AuthError::Identity(e.to_string()))?;
        if message.destination != own.as_str() {
            return Err(AuthError::WrongDestination(message.destination.clone()));
        }

        if let Some(expected) = expected {
            if message.source != expected.as_str() {
                return Err(AuthError::UnexpectedPeer { expected: expected.clone(), actual: message.source.clone() });
            }
        }

        let skew_ms = now_millis().saturating_sub(message.timestamp);
        if skew_ms.unsigned_abs() > self.max_clock_skew.as_millis() as u64 {
            return Err(AuthError::StaleTimestamp { timestamp: message.timestamp, skew_ms });
        }

        let source = Identifier::parse(&message.source)
            .map_err(|e| AuthError::InvalidIdentifier(format!("{}: {e}", message.source)))?;

        match CryptoIdentity::derive_identifier(&message.public_key) {
            Ok(derived) if derived == source => {}
            _ => return Err(AuthError::KeyMismatch(message.source.clone())),
        }

        let payload = AuthenticationMessage::signing_payload(
            &message.source,
            &message.destination,
            &message.public_key,
            message.timestamp,
        );
        if !CryptoIdentity::verify(&payload, &message.signature, &message.public_key) {
            return Err(AuthError::BadSignature);
        }

        Ok(source)
    }
}

impl<S: Serializer> Authenticator for PublicKeyAuthenticator<S> {
    fn start(&mut self) -> AuthStep {
        if self.state != AuthState::Idle {
            return AuthStep::Failed(AuthError::AlreadyFinished);
        }

        let Role::Initiator { remote } = &self.role else {
            self.state = AuthState::AwaitingPeer;
            return AuthStep::Continue { send: None };
        };

        let opening = AuthenticationMessage::signed(&self.identity, remote, now_millis())
            .map_err(|e| AuthError::Identity(e.to_string()))
            .and_then(|message| self.serializer.serialize(&message).map_err(AuthError::from));
        match opening {
            Ok(frame) => {
                self.state = AuthState::AwaitingPeer;
                AuthStep::Continue { send: Some(frame) }
            }
            Err(e) => self.fail(e),
        }
    }

    fn receive(&mut self, frame: &[u8]) -> AuthStep {
        if self.state != AuthState::AwaitingPeer {
            return AuthStep::Failed(AuthError::AlreadyFinished);
        }

        match &self.role {
            Role::Initiator { remote } => {
                if frame == [AUTH_SUCCESS].as_slice() {
                    let peer = remote.clone();
                    self.state = AuthState::Succeeded;
                    debug!(peer = %peer, "Peer accepted our proof");
                    AuthStep::Succeeded { peer, send: None }
                } else {
                    self.fail(AuthError::UnexpectedReply)
                }
            }
            Role::Responder { expected } => {
                let verdict = self
                    .serializer
                    .deserialize::<AuthenticationMessage>(frame)
                    .map_err(AuthError::from)
                    .and_then(|message| self.validate(&message, expected.as_ref()));
                match verdict {
                    Ok(peer) => {
                        self.state = AuthState::Succeeded;
                        debug!(peer = %peer, "Authenticated peer");
                        AuthStep::Succeeded { peer, send: Some(vec![AUTH_SUCCESS]) }
                    }
                    Err(e) => {
                        warn!(error = %e, "Rejected handshake");
                        self.fail(e)
                    }
                }
            }
        }
    }

    fn state(&self) -> AuthState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        a: Arc<CryptoIdentity>,
        b: Arc<CryptoIdentity>,
        ida: Identifier,
        idb: Identifier,
    }

    fn fixture() -> Fixture {
        let a = Arc::new(CryptoIdentity::from_seed(&[1; 32]));
        let b = Arc::new(CryptoIdentity::from_seed(&[2; 32]));
        let ida = a.identifier().unwrap();
        let idb = b.identifier().unwrap();
        Fixture { a, b, ida, idb }
    }

    fn responder(fx: &Fixture, expected: Option<Identifier>) -> PublicKeyAuthenticator {
        let mut r = PublicKeyAuthenticator::responder(fx.a.clone(), expected, BincodeSerializer::default());
        assert_eq!(r.start(), AuthStep::Continue { send: None });
        r
    }

    fn encode(message: &AuthenticationMessage) -> Vec<u8> {
        BincodeSerializer::default().serialize(message).unwrap()
    }

    fn failure(step: AuthStep) -> AuthError {
        match step {
            AuthStep::Failed(e) => e,
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_handshake_succeeds() {
        let fx = fixture();
        let mut initiator =
            PublicKeyAuthenticator::initiator(fx.b.clone(), fx.ida.clone(), BincodeSerializer::default());
        let mut responder = responder(&fx, Some(fx.idb.clone()));

        let AuthStep::Continue { send: Some(opening) } = initiator.start() else {
            panic!("initiator must open the handshake");
        };
        assert_eq!(initiator.state(), AuthState::AwaitingPeer);

        let verdict = responder.receive(&opening);
        assert_eq!(verdict, AuthStep::Succeeded { peer: fx.idb.clone(), send: Some(vec![AUTH_SUCCESS]) });
        assert_eq!(responder.state(), AuthState::Succeeded);

        assert_eq!(initiator.receive(&[AUTH_SUCCESS]), AuthStep::Succeeded { peer: fx.ida.clone(), send: None });
        assert_eq!(initiator.state(), AuthState::Succeeded);
    }

    #[test]
    fn test_single_byte_flips_fail() {
        let fx = fixture();
        let good = AuthenticationMessage::signed(&fx.b, &fx.ida, now_millis()).unwrap();

        let mut cases = Vec::new();
        for i in [0, 31, 63] {
            let mut m = good.clone();
            m.signature[i] ^= 0x01;
            cases.push(("signature", m));
        }
        for i in [0, 16, 31] {
            let mut m = good.clone();
            m.public_key[i] ^= 0x01;
            cases.push(("public_key", m));
        }
        {
            let mut m = good.clone();
            m.source = flip_char(&m.source, 3);
            cases.push(("source", m));
        }
        {
            let mut m = good.clone();
            m.destination = flip_char(&m.destination, 3);
            cases.push(("destination", m));
        }

        for (field, message) in cases {
            let mut r = responder(&fx, None);
            let step = r.receive(&encode(&message));
            assert!(matches!(step, AuthStep::Failed(_)), "flipping {field} must fail");
            assert_eq!(r.state(), AuthState::Failed);
        }
    }

    fn flip_char(text: &str, index: usize) -> String {
        let mut chars: Vec<char> = text.chars().collect();
        chars[index] = if chars[index] == 'a' { 'b' } else { 'a' };
        chars.into_iter().collect()
    }

    #[test]
    fn test_timestamp_window() {
        let fx = fixture();
        for offset in [-120_000i64, 120_000] {
            let message = AuthenticationMessage::signed(&fx.b, &fx.ida, now_millis() + offset).unwrap();
            let err = failure(responder(&fx, None).receive(&encode(&message)));
            assert!(matches!(err, AuthError::StaleTimestamp { .. }), "offset {offset}: {err}");
        }

        let message = AuthenticationMessage::signed(&fx.b, &fx.ida, now_millis() - 30_000).unwrap();
        assert!(matches!(responder(&fx, None).receive(&encode(&message)), AuthStep::Succeeded { .. }));
    }

    #[test]
    fn test_wrong_destination() {
        let fx = fixture();
        let message = AuthenticationMessage::signed(&fx.b, &fx.idb, now_millis()).unwrap();
        let err = failure(responder(&fx, None).receive(&encode(&message)));
        assert!(matches!(err, AuthError::WrongDestination(_)));
    }

    #[test]
    fn test_pinned_peer_mismatch() {
        let fx = fixture();
        let other = CryptoIdentity::generate().identifier().unwrap();
        let message = AuthenticationMessage::signed(&fx.b, &fx.ida, now_millis()).unwrap();
        let err = failure(responder(&fx, Some(other)).receive(&encode(&message)));
        assert!(matches!(err, AuthError::UnexpectedPeer { .. }));
    }

    #[test]
    fn test_key_not_matching_source() {
        let fx = fixture();
        let mallory = CryptoIdentity::generate();
        // Signed correctly, but with a key that does not derive B's identifier
        let source = fx.idb.to_string();
        let destination = fx.ida.to_string();
        let public_key = mallory.public_key().unwrap().to_vec();
        let timestamp = now_millis();
        let signature = mallory
            .sign(&AuthenticationMessage::signing_payload(&source, &destination, &public_key, timestamp))
            .unwrap()
            .to_vec();
        let message = AuthenticationMessage { source, destination, public_key, timestamp, signature };

        let err = failure(responder(&fx, None).receive(&encode(&message)));
        assert!(matches!(err, AuthError::KeyMismatch(_)));
    }

    #[test]
    fn test_missing_fields_and_garbage() {
        let fx = fixture();
        let mut message = AuthenticationMessage::signed(&fx.b, &fx.ida, now_millis()).unwrap();
        message.signature.clear();
        let err = failure(responder(&fx, None).receive(&encode(&message)));
        assert_eq!(err, AuthError::MissingField("signature"));

        let err = failure(responder(&fx, None).receive(&[0xFF, 0x00, 0x13]));
        assert!(matches!(err, AuthError::Malformed(_)));
    }

    #[test]
    fn test_initiator_rejects_other_replies() {
        let fx = fixture();
        let mut initiator = PublicKeyAuthenticator::initiator(fx.b.clone(), fx.ida.clone(), BincodeSerializer::default());
        initiator.start();
        assert_eq!(failure(initiator.receive(&[0x02])), AuthError::UnexpectedReply);
        assert_eq!(failure(initiator.receive(&[AUTH_SUCCESS])), AuthError::AlreadyFinished);
    }

    #[test]
    fn test_initiator_without_key_fails() {
        let fx = fixture();
        let mut initiator =
            PublicKeyAuthenticator::initiator(Arc::new(CryptoIdentity::new()), fx.ida, BincodeSerializer::default());
        assert!(matches!(failure(initiator.start()), AuthError::Identity(_)));
        assert_eq!(initiator.state(), AuthState::Failed);
    }
}
