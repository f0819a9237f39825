//! Relay registration authentication
//!
//! An authenticator maps REGISTER credentials to the user owning the
//! session. Sessions of different users cannot take over each other's
//! endpoint ids or exchange envelopes.

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const TOKEN_CONTEXT: &str = "peerstore relay token v1";

/// Authenticated owner of a relay session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Owner assigned when no authenticator is configured
    pub fn anonymous() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            f.write_str("<anonymous>")
        } else {
            f.write_str(&self.0)
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing credentials")]
    MissingCredentials,
    #[error("Malformed token")]
    Malformed,
    #[error("Token signature mismatch")]
    BadSignature,
    #[error("Token expired")]
    Expired,
    #[error("Token audience {found:?} does not match {expected:?}")]
    WrongAudience { expected: String, found: String },
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: Option<&str>) -> Result<UserId, AuthError>;
}

/// Admits everyone as the anonymous user
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuthenticator;

#[async_trait]
impl Authenticator for NullAuthenticator {
    async fn authenticate(&self, _credentials: Option<&str>) -> Result<UserId, AuthError> {
        Ok(UserId::anonymous())
    }
}

/// Shared-secret bearer tokens: `<user-hex>.<audience-hex>.<expires-unix>.<mac-hex>`,
/// where the MAC is a keyed BLAKE3 hash of the first three fields. User and
/// audience are hex-encoded so they may contain any character, dots included.
pub struct TokenAuthenticator {
    key: [u8; 32],
    audience: String,
}

impl TokenAuthenticator {
    pub fn new(secret: &str, audience: impl Into<String>) -> Self {
        Self {
            key: blake3::derive_key(TOKEN_CONTEXT, secret.as_bytes()),
            audience: audience.into(),
        }
    }

    /// Mint a token for `user` valid for `ttl`
    pub fn issue(&self, user: &str, ttl: Duration) -> String {
        let expires = unix_now().saturating_add(ttl.as_secs());
        self.sign(user, &self.audience, expires)
    }

    fn sign(&self, user: &str, audience: &str, expires: u64) -> String {
        let claims = format!("{}.{}.{}", hex::encode(user), hex::encode(audience), expires);
        let mac = blake3::keyed_hash(&self.key, claims.as_bytes());
        format!("{}.{}", claims, mac.to_hex())
    }

    fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let (claims, mac_hex) = token.rsplit_once('.').ok_or(AuthError::Malformed)?;
        let mut fields = claims.split('.');
        let (user, audience, expires) =
            match (fields.next(), fields.next(), fields.next(), fields.next()) {
                (Some(u), Some(a), Some(e), None) if !u.is_empty() => (u, a, e),
                _ => return Err(AuthError::Malformed),
            };
        let user = decode_field(user)?;
        let audience = decode_field(audience)?;
        let expires: u64 = expires.parse().map_err(|_| AuthError::Malformed)?;

        let mac_bytes: [u8; 32] = hex::decode(mac_hex)
            .map_err(|_| AuthError::Malformed)?
            .try_into()
            .map_err(|_| AuthError::Malformed)?;
        // blake3::Hash equality is constant-time
        let expected = blake3::keyed_hash(&self.key, claims.as_bytes());
        if expected != blake3::Hash::from(mac_bytes) {
            return Err(AuthError::BadSignature);
        }
        if audience != self.audience {
            return Err(AuthError::WrongAudience {
                expected: self.audience.clone(),
                found: audience,
            });
        }
        if expires <= unix_now() {
            return Err(AuthError::Expired);
        }
        Ok(UserId::new(user))
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, credentials: Option<&str>) -> Result<UserId, AuthError> {
        let token = credentials.ok_or(AuthError::MissingCredentials)?;
        self.verify(token)
    }
}

fn decode_field(field: &str) -> Result<String, AuthError> {
    let bytes = hex::decode(field).map_err(|_| AuthError::Malformed)?;
    String::from_utf8(bytes).map_err(|_| AuthError::Malformed)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
