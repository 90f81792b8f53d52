//! Signed session tokens
//!
//! A session is an HS256 JWT carried in a single HTTP-only cookie. The
//! signing key lives on the [`SessionManager`](super::SessionManager)
//! instance; by default it is generated at startup, so a restart invalidates
//! every outstanding session unless a persisted key file is configured.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::identity::AuthContext;

/// Name of the session cookie
pub const SESSION_COOKIE: &str = "kuill";

/// Claim names owned by the session itself; extra claims never override them
pub const RESERVED_CLAIMS: &[&str] = &["exp", "nbf", "iat", "csrf", "uid", "grp"];

/// Minimum accepted length of a persisted signing key
const MIN_KEY_LEN: usize = 32;

/// Default session lifetime (15 minutes)
pub const DEFAULT_SESSION_LIFETIME: Duration = Duration::from_secs(15 * 60);

/// Default remaining lifetime below which a session is re-minted
pub const DEFAULT_RENEW_THRESHOLD: Duration = Duration::from_secs(60);

/// Symmetric session signing key (zeroized on drop)
pub struct SessionKey(Zeroizing<Vec<u8>>);

impl SessionKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; MIN_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(Zeroizing::new(bytes))
    }

    /// Use the given bytes as the key
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < MIN_KEY_LEN {
            return Err(Error::Config(format!(
                "session secret must be at least {} bytes",
                MIN_KEY_LEN
            )));
        }
        Ok(Self(Zeroizing::new(bytes)))
    }

    /// Load a key from a file, ignoring surrounding whitespace
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = Zeroizing::new(tokio::fs::read(path).await.map_err(|e| {
            Error::Config(format!("failed to read session secret {}: {}", path.display(), e))
        })?);
        let trimmed = raw.trim_ascii().to_vec();
        Self::from_bytes(trimmed)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Session lifetime settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time from issue to expiry
    pub lifetime: Duration,
    /// Re-mint when less than this remains
    pub renew_threshold: Duration,
    /// Mark the cookie `Secure`
    pub secure_cookie: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lifetime: DEFAULT_SESSION_LIFETIME,
            renew_threshold: DEFAULT_RENEW_THRESHOLD,
            secure_cookie: true,
        }
    }
}

/// JWT claims of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Expiry (seconds since epoch)
    pub exp: i64,
    /// Not before (seconds since epoch)
    pub nbf: i64,
    /// Issued at (seconds since epoch)
    pub iat: i64,
    /// Random CSRF nonce
    pub csrf: String,
    /// Username
    pub uid: String,
    /// Comma-joined groups
    pub grp: String,
    /// Provider-specific opaque claims
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A verified or freshly minted session
#[derive(Debug, Clone)]
pub struct SessionToken {
    claims: SessionClaims,
    encoded: String,
}

impl SessionToken {
    pub(crate) fn new(claims: SessionClaims, encoded: String) -> Self {
        Self { claims, encoded }
    }

    /// Username
    pub fn user(&self) -> &str {
        &self.claims.uid
    }

    /// Group memberships
    pub fn groups(&self) -> Vec<String> {
        split_groups(&self.claims.grp)
    }

    /// Identity carried by this session
    pub fn context(&self) -> AuthContext {
        AuthContext::new(self.claims.uid.clone(), self.groups())
    }

    /// When the session was issued
    pub fn issued_at(&self) -> DateTime<Utc> {
        timestamp(self.claims.iat)
    }

    /// When the session expires
    pub fn expires_at(&self) -> DateTime<Utc> {
        timestamp(self.claims.exp)
    }

    /// CSRF nonce
    pub fn csrf(&self) -> &str {
        &self.claims.csrf
    }

    /// Provider-specific claims
    pub fn extra(&self) -> &Map<String, Value> {
        &self.claims.extra
    }

    /// Raw claims
    pub fn claims(&self) -> &SessionClaims {
        &self.claims
    }

    /// Signed compact JWT
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// Time left before expiry as of `now`, zero when already expired
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at() - now).to_std().unwrap_or(Duration::ZERO)
    }
}

pub(crate) fn join_groups(groups: &[String]) -> String {
    groups
        .iter()
        .filter(|g| !g.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join(",")
}

fn split_groups(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .collect()
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
