//! User identity and backend identity headers
//!
//! Two mutually exclusive injection modes:
//! - **Impersonation**: `Impersonate-User` / `Impersonate-Group`. The
//!   gateway's own backend credential must hold the `impersonate` privilege.
//! - **Trusted headers**: plain username/group headers the backend accepts
//!   because it trusts this gateway as an authenticating front end.
//!
//! Groups are sent as repeated header instances, never comma-joined.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;

use crate::error::{Error, Result};

/// Impersonation header names
const IMPERSONATE_USER: &str = "impersonate-user";
const IMPERSONATE_GROUP: &str = "impersonate-group";
const IMPERSONATE_UID: &str = "impersonate-uid";
const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

/// Default trusted-header names
pub const DEFAULT_USER_HEADER: &str = "X-Remote-User";
/// Default trusted group header
pub const DEFAULT_GROUP_HEADER: &str = "X-Remote-Group";
/// Default trusted extra-attribute header prefix
pub const DEFAULT_EXTRA_PREFIX: &str = "X-Remote-Extra-";

/// Resolved identity of the user behind a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthContext {
    /// Username
    pub user: String,
    /// Group memberships, unique and in first-seen order
    pub groups: Vec<String>,
}

impl AuthContext {
    /// Build a context, dropping empty and duplicate groups
    pub fn new<I, S>(user: impl Into<String>, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ctx = Self {
            user: user.into(),
            groups: Vec::new(),
        };
        ctx.extend_groups(groups);
        ctx
    }

    fn extend_groups<I, S>(&mut self, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for group in groups {
            let group = group.into();
            if !group.is_empty() && !self.groups.contains(&group) {
                self.groups.push(group);
            }
        }
    }
}

/// How identity is conveyed to the backend
#[derive(Debug, Clone)]
pub enum IdentityMode {
    /// Backend-native impersonation headers
    Impersonation,
    /// Front-proxy headers trusted by the backend
    TrustedHeaders {
        /// Header carrying the username
        user_header: HeaderName,
        /// Header carrying each group
        group_header: HeaderName,
        /// Prefix of extra-attribute headers (lowercase)
        extra_prefix: String,
    },
}

impl IdentityMode {
    /// Trusted-header mode with the given header names
    pub fn trusted_headers(user_header: &str, group_header: &str, extra_prefix: &str) -> Result<Self> {
        let parse = |name: &str| {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("invalid header name '{}': {}", name, e)))
        };
        Ok(IdentityMode::TrustedHeaders {
            user_header: parse(user_header)?,
            group_header: parse(group_header)?,
            extra_prefix: extra_prefix.to_ascii_lowercase(),
        })
    }
}

/// Writes identity headers for backend requests
#[derive(Debug, Clone)]
pub struct IdentityInjector {
    mode: IdentityMode,
    authenticated_groups: Vec<String>,
}

impl IdentityInjector {
    /// Create an injector
    ///
    /// `authenticated_groups` are appended to every user's groups.
    pub fn new(mode: IdentityMode, authenticated_groups: Vec<String>) -> Self {
        Self {
            mode,
            authenticated_groups,
        }
    }

    /// Injection mode
    pub fn mode(&self) -> &IdentityMode {
        &self.mode
    }

    /// Identity as the backend will see it, with the group overlay applied
    pub fn effective(&self, ctx: &AuthContext) -> AuthContext {
        let mut out = ctx.clone();
        out.extend_groups(self.authenticated_groups.iter().cloned());
        out
    }

    /// Remove any identity headers a client may have supplied
    ///
    /// Impersonation headers are removed in both modes, as are the
    /// configured trusted headers.
    pub fn strip(&self, headers: &mut HeaderMap) {
        headers.remove(IMPERSONATE_USER);
        headers.remove(IMPERSONATE_GROUP);
        headers.remove(IMPERSONATE_UID);

        let mut prefixes = vec![IMPERSONATE_EXTRA_PREFIX.to_string()];
        if let IdentityMode::TrustedHeaders {
            user_header,
            group_header,
            extra_prefix,
        } = &self.mode
        {
            headers.remove(user_header);
            headers.remove(group_header);
            prefixes.push(extra_prefix.clone());
        }

        let extras: Vec<HeaderName> = headers
            .keys()
            .filter(|k| prefixes.iter().any(|p| k.as_str().starts_with(p.as_str())))
            .cloned()
            .collect();
        for name in extras {
            headers.remove(name);
        }
    }

    /// Replace any identity headers in `headers` with ones for `ctx`
    pub fn apply(&self, headers: &mut HeaderMap, ctx: &AuthContext) -> Result<()> {
        self.strip(headers);

        let (user_header, group_header) = match &self.mode {
            IdentityMode::Impersonation => (
                HeaderName::from_static(IMPERSONATE_USER),
                HeaderName::from_static(IMPERSONATE_GROUP),
            ),
            IdentityMode::TrustedHeaders {
                user_header,
                group_header,
                ..
            } => (user_header.clone(), group_header.clone()),
        };

        let effective = self.effective(ctx);
        headers.insert(user_header, header_value(&effective.user)?);
        for group in &effective.groups {
            headers.append(group_header.clone(), header_value(group)?);
        }
        Ok(())
    }

    /// Identity headers for `ctx` alone
    pub fn headers_for(&self, ctx: &AuthContext) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        self.apply(&mut headers, ctx)?;
        Ok(headers)
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| Error::Protocol(format!("identity '{}' cannot be sent as a header", value)))
}
