//! Credential verification and relay access tokens.
//!
//! Observers authenticate once per connection with a bearer token minted
//! by a [`TokenAuthority`]. Tokens are `base64url(claims).base64url(tag)`
//! where the tag is HMAC-SHA256 over the encoded claims.
//!
//! Passwords are stored as PBKDF2-HMAC-SHA256 hashes in the form
//! `pbkdf2-sha256$<iterations>$<salt hex>$<digest hex>`.

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use ring::{digest, hmac, pbkdf2};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Default token lifetime: 24 hours.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

/// Length of a token signing secret in bytes.
pub const SECRET_LENGTH: usize = 32;

/// Default PBKDF2 iteration count for new password hashes.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;

const PASSWORD_HASH_SCHEME: &str = "pbkdf2-sha256";
const SALT_LENGTH: usize = 16;
const PBKDF2_ALGORITHM: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

/// Checks a presented password.
///
/// The relay treats implementations as black boxes returning a yes/no answer.
pub trait CredentialVerifier: Send + Sync {
    /// Returns true if the password is accepted.
    fn verify(&self, password: &str) -> bool;
}

/// Generates a random token signing secret.
pub fn generate_secret() -> [u8; SECRET_LENGTH] {
    let mut secret = [0u8; SECRET_LENGTH];
    OsRng.fill_bytes(&mut secret);
    secret
}

/// Claims carried inside a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Always true for tokens minted after a successful login.
    pub authenticated: bool,
    /// Issued-at, Unix seconds.
    pub iat: i64,
    /// Expiry, Unix seconds.
    pub exp: i64,
}

/// Mints and verifies signed, expiring access tokens.
pub struct TokenAuthority {
    key: hmac::Key,
    ttl_secs: u64,
}

impl TokenAuthority {
    /// Creates an authority from a signing secret and token lifetime.
    pub fn new(secret: &[u8], ttl_secs: u64) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            ttl_secs,
        }
    }

    /// Returns the configured token lifetime in seconds.
    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Issues a token valid from now for the configured lifetime.
    pub fn issue(&self) -> Result<String> {
        self.issue_at(Utc::now().timestamp())
    }

    /// Issues a token as if the current time were `now`.
    pub fn issue_at(&self, now: i64) -> Result<String> {
        let ttl = i64::try_from(self.ttl_secs).unwrap_or(i64::MAX);
        let claims = TokenClaims {
            authenticated: true,
            iat: now,
            exp: now.saturating_add(ttl),
        };
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let tag = hmac::sign(&self.key, payload.as_bytes());
        Ok(format!("{}.{}", payload, URL_SAFE_NO_PAD.encode(tag.as_ref())))
    }

    /// Verifies a token against the current time.
    pub fn verify(&self, token: &str) -> Result<TokenClaims> {
        self.verify_at(token, Utc::now().timestamp())
    }

    /// Verifies signature, claims and expiry as if the current time were `now`.
    pub fn verify_at(&self, token: &str, now: i64) -> Result<TokenClaims> {
        let (payload, tag) = token
            .split_once('.')
            .ok_or_else(|| ProtocolError::InvalidToken("missing signature".to_string()))?;

        let tag = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|e| ProtocolError::InvalidToken(format!("bad signature encoding: {}", e)))?;
        hmac::verify(&self.key, payload.as_bytes(), &tag)
            .map_err(|_| ProtocolError::InvalidToken("signature mismatch".to_string()))?;

        let raw = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| ProtocolError::InvalidToken(format!("bad payload encoding: {}", e)))?;
        let claims: TokenClaims = serde_json::from_slice(&raw)
            .map_err(|e| ProtocolError::InvalidToken(format!("bad claims: {}", e)))?;

        if !claims.authenticated {
            return Err(ProtocolError::InvalidToken(
                "token does not grant access".to_string(),
            ));
        }
        if now >= claims.exp {
            return Err(ProtocolError::TokenExpired {
                expired_at: claims.exp,
            });
        }

        Ok(claims)
    }
}

impl fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

/// A salted PBKDF2 password hash.
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordHash {
    iterations: NonZeroU32,
    salt: Vec<u8>,
    digest: Vec<u8>,
}

impl PasswordHash {
    /// Hashes a password with a fresh random salt and the default cost.
    pub fn create(password: &str) -> Self {
        let iterations = NonZeroU32::new(DEFAULT_PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN);
        Self::create_with_iterations(password, iterations)
    }

    /// Hashes a password with a fresh random salt and an explicit cost.
    pub fn create_with_iterations(password: &str, iterations: NonZeroU32) -> Self {
        let mut salt = vec![0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);

        let mut digest = vec![0u8; digest::SHA256_OUTPUT_LEN];
        pbkdf2::derive(
            PBKDF2_ALGORITHM,
            iterations,
            &salt,
            password.as_bytes(),
            &mut digest,
        );

        Self {
            iterations,
            salt,
            digest,
        }
    }

    /// Returns the iteration count.
    pub fn iterations(&self) -> u32 {
        self.iterations.get()
    }
}

impl CredentialVerifier for PasswordHash {
    fn verify(&self, password: &str) -> bool {
        pbkdf2::verify(
            PBKDF2_ALGORITHM,
            self.iterations,
            &self.salt,
            password.as_bytes(),
            &self.digest,
        )
        .is_ok()
    }
}

impl fmt::Display for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}${}${}${}",
            PASSWORD_HASH_SCHEME,
            self.iterations,
            hex::encode(&self.salt),
            hex::encode(&self.digest)
        )
    }
}

impl fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordHash")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

impl FromStr for PasswordHash {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| ProtocolError::InvalidPasswordHash(reason.to_string());

        let mut parts = s.trim().split('$');
        let scheme = parts.next().ok_or_else(|| invalid("empty"))?;
        if scheme != PASSWORD_HASH_SCHEME {
            return Err(invalid("unsupported scheme"));
        }

        let iterations = parts
            .next()
            .and_then(|v| v.parse::<u32>().ok())
            .and_then(NonZeroU32::new)
            .ok_or_else(|| invalid("bad iteration count"))?;
        let salt = parts
            .next()
            .and_then(|v| hex::decode(v).ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| invalid("bad salt"))?;
        let digest = parts
            .next()
            .and_then(|v| hex::decode(v).ok())
            .filter(|v| v.len() == digest::SHA256_OUTPUT_LEN)
            .ok_or_else(|| invalid("bad digest"))?;

        if parts.next().is_some() {
            return Err(invalid("trailing fields"));
        }

        Ok(Self {
            iterations,
            salt,
            digest,
        })
    }
}
