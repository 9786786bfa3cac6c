//! Authentication mechanisms.
//!
//! A mechanism is a small state machine driven to completion by the
//! handshake: the acceptor side issues challenges and verdicts, the
//! initiator side answers challenges. Credentials come from the key store
//! or, when present, an [`AuthListener`] that can ask the hosting
//! application.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Mechanism name of [`AnonymousMechanism`].
pub const ANONYMOUS: &str = "ANONYMOUS";

/// Mechanism name of [`HmacSha256Mechanism`].
pub const HMAC_SHA256: &str = "HMAC-SHA256";

/// Source of long-term credentials. The real store lives outside the
/// routing core; the daemon only pulls secrets through this seam.
pub trait KeyStore: Send + Sync {
    /// The bus shared secret, if one is provisioned.
    fn secret(&self) -> Option<Vec<u8>>;
}

/// Key store holding at most one secret in memory.
#[derive(Default)]
pub struct InMemoryKeyStore {
    secret: std::sync::Mutex<Option<Vec<u8>>>,
}

impl InMemoryKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_secret(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: std::sync::Mutex::new(Some(secret.into())),
        }
    }

    pub fn set_secret(&self, secret: impl Into<Vec<u8>>) {
        *self.secret.lock().unwrap() = Some(secret.into());
    }
}

impl KeyStore for InMemoryKeyStore {
    fn secret(&self) -> Option<Vec<u8>> {
        self.secret.lock().unwrap().clone()
    }
}

/// Callout for mechanisms that need to ask the application for credentials.
pub trait AuthListener: Send + Sync {
    /// Returns the secret to use with `mechanism`, or `None` to fall back
    /// to the key store.
    fn request_secret(&self, mechanism: &str) -> Option<Vec<u8>>;
}

/// Acceptor-side step outcome.
#[derive(Debug, PartialEq, Eq)]
pub enum ServerVerdict {
    /// Send this challenge and wait for a response.
    Challenge(Vec<u8>),
    /// Authentication succeeded.
    Ok,
    /// Authentication failed; the handshake sends a reject and closes.
    Reject,
}

/// One authentication exchange. A fresh instance is created per handshake;
/// instances are never reused.
pub trait AuthMechanism: Send {
    /// Registered mechanism name.
    fn name(&self) -> &'static str;

    /// Acceptor: open the exchange. `Ok` means no challenge is needed.
    fn first_challenge(&mut self) -> ServerVerdict;

    /// Acceptor: judge the response to the previous challenge.
    fn verify(&mut self, response: &[u8]) -> ServerVerdict;

    /// Initiator: answer a challenge, or `None` if no credentials are
    /// available.
    fn respond(&mut self, challenge: &[u8]) -> Option<Vec<u8>>;
}

/// No-credential mechanism. Accepts every peer in a single round.
#[derive(Debug, Default)]
pub struct AnonymousMechanism;

impl AuthMechanism for AnonymousMechanism {
    fn name(&self) -> &'static str {
        ANONYMOUS
    }

    fn first_challenge(&mut self) -> ServerVerdict {
        ServerVerdict::Ok
    }

    fn verify(&mut self, _response: &[u8]) -> ServerVerdict {
        ServerVerdict::Reject
    }

    fn respond(&mut self, _challenge: &[u8]) -> Option<Vec<u8>> {
        Some(Vec::new())
    }
}

/// Shared-secret challenge/response mechanism.
///
/// The acceptor sends a random 32-byte nonce; the initiator answers with
/// `HMAC-SHA256(secret, nonce)`. Verification is constant-time.
pub struct HmacSha256Mechanism {
    secret: Option<Vec<u8>>,
    nonce: Option<[u8; 32]>,
}

impl HmacSha256Mechanism {
    #[must_use]
    pub fn new(secret: Option<Vec<u8>>) -> Self {
        Self {
            secret,
            nonce: None,
        }
    }

    fn mac(secret: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

impl AuthMechanism for HmacSha256Mechanism {
    fn name(&self) -> &'static str {
        HMAC_SHA256
    }

    fn first_challenge(&mut self) -> ServerVerdict {
        if self.secret.is_none() {
            return ServerVerdict::Reject;
        }
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.nonce = Some(nonce);
        ServerVerdict::Challenge(nonce.to_vec())
    }

    fn verify(&mut self, response: &[u8]) -> ServerVerdict {
        let (Some(secret), Some(nonce)) = (self.secret.as_deref(), self.nonce.take()) else {
            return ServerVerdict::Reject;
        };
        let expected = Self::mac(secret, &nonce);
        if bool::from(expected.as_slice().ct_eq(response)) {
            ServerVerdict::Ok
        } else {
            ServerVerdict::Reject
        }
    }

    fn respond(&mut self, challenge: &[u8]) -> Option<Vec<u8>> {
        self.secret.as_deref().map(|s| Self::mac(s, challenge))
    }
}
