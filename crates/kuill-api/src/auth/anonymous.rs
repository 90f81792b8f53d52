//! Anonymous login

use async_trait::async_trait;
use serde_json::Map;

use super::{AuthOutcome, Authenticator, LoginRequest, SessionManager};
use crate::error::Result;

/// Logs every visitor in as one configured user
pub struct AnonymousAuthenticator {
    user: String,
    groups: Vec<String>,
}

impl AnonymousAuthenticator {
    /// Create an authenticator issuing sessions for `user`
    pub fn new(user: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            user: user.into(),
            groups,
        }
    }
}

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    fn name(&self) -> &str {
        &self.user
    }

    fn kind(&self) -> &str {
        "anonymous"
    }

    fn description(&self) -> &str {
        "Anonymous access"
    }

    async fn authenticate(
        &self,
        request: LoginRequest,
        sessions: &SessionManager,
    ) -> Result<AuthOutcome> {
        let token = sessions.new_session_token(&self.user, &self.groups, Map::new())?;
        Ok(AuthOutcome::Authenticated {
            token,
            target: request.target(),
            cookies: Vec::new(),
        })
    }
}
