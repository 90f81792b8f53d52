//! Static credentials file login
//!
//! The file is tab-separated, one user per line:
//! `{username}\t{password}\t{group}\t{group}...`. Only suitable for testing
//! and small installations.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Map;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::{AuthOutcome, Authenticator, LoginRequest, SessionManager};
use crate::error::{Error, Result};

struct Credential {
    password: Zeroizing<String>,
    groups: Vec<String>,
}

/// Checks posted credentials against a static file
pub struct PasswordFileAuthenticator {
    name: String,
    users: HashMap<String, Credential>,
}

impl PasswordFileAuthenticator {
    /// Parse credentials from file contents
    ///
    /// Blank lines and lines starting with `#` are skipped.
    pub fn parse(name: impl Into<String>, contents: &str) -> Result<Self> {
        let mut users = HashMap::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split('\t');
            let user = fields.next().unwrap_or_default();
            let password = fields.next().ok_or_else(|| {
                Error::Config(format!("password file line {}: missing password", lineno + 1))
            })?;
            if user.is_empty() {
                return Err(Error::Config(format!(
                    "password file line {}: missing username",
                    lineno + 1
                )));
            }
            users.insert(
                user.to_string(),
                Credential {
                    password: Zeroizing::new(password.to_string()),
                    groups: fields.filter(|g| !g.is_empty()).map(str::to_string).collect(),
                },
            );
        }
        Ok(Self {
            name: name.into(),
            users,
        })
    }

    /// Load credentials from a file
    pub async fn load(name: impl Into<String>, path: &Path) -> Result<Self> {
        let contents = Zeroizing::new(tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!("failed to read password file {}: {}", path.display(), e))
        })?);
        let authenticator = Self::parse(name, &contents)?;
        info!(users = authenticator.users.len(), path = %path.display(), "Loaded password file");
        Ok(authenticator)
    }

    fn check(&self, user: &str, password: &str) -> Option<&Credential> {
        self.users
            .get(user)
            .filter(|c| constant_time_eq(c.password.as_bytes(), password.as_bytes()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[async_trait]
impl Authenticator for PasswordFileAuthenticator {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "pwfile"
    }

    fn description(&self) -> &str {
        &self.name
    }

    fn posts_credentials(&self) -> bool {
        true
    }

    async fn authenticate(
        &self,
        request: LoginRequest,
        sessions: &SessionManager,
    ) -> Result<AuthOutcome> {
        let user = request.param("username").unwrap_or_default();
        let password = request.param("password").unwrap_or_default();

        let Some(credential) = self.check(user, password) else {
            debug!(user = %user, "Invalid login");
            return Err(Error::Unauthorized("invalid username and/or password".into()));
        };

        debug!(user = %user, "Logged in");
        let token = sessions.new_session_token(user, &credential.groups, Map::new())?;
        Ok(AuthOutcome::Authenticated {
            token,
            target: request.target(),
            cookies: Vec::new(),
        })
    }
}
