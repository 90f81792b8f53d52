//! Sessions and pluggable login methods
//!
//! Every login method implements [`Authenticator`]. The [`SessionManager`]
//! owns the registry of authenticators and the session signing key, and
//! provides the `require_session` middleware that guards the proxy routes.

mod anonymous;
mod handlers;
mod manager;
mod oidc;
mod pwfile;
mod session;

use std::collections::HashMap;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, COOKIE};
use axum::http::{HeaderMap, Method, Request};
use cookie::Cookie;

use crate::error::{Error, Result};

pub use anonymous::AnonymousAuthenticator;
pub use handlers::{login_handler, login_methods_handler, user_info_handler};
pub use manager::{require_session, SessionManager};
pub(crate) use manager::cookie_header_value;
pub use oidc::{OidcAuthenticator, OidcConfig};
pub use pwfile::PasswordFileAuthenticator;
pub use session::{
    SessionClaims, SessionConfig, SessionKey, SessionToken, DEFAULT_RENEW_THRESHOLD,
    DEFAULT_SESSION_LIFETIME, RESERVED_CLAIMS, SESSION_COOKIE,
};

/// Maximum accepted size of a login form body
const MAX_FORM_SIZE: usize = 64 * 1024;

/// A login method
///
/// Provider-specific protocol detail stays inside the implementation; the
/// gateway only sees the descriptive fields and the outcome of
/// [`authenticate`](Authenticator::authenticate).
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Instance name, unique within its type
    fn name(&self) -> &str;

    /// Authenticator type, e.g. `oidc`
    fn kind(&self) -> &str;

    /// Human-readable description
    fn description(&self) -> &str;

    /// Icon URL; empty means the UI default
    fn icon_url(&self) -> &str {
        ""
    }

    /// Login entry point
    fn login_url(&self) -> String {
        format!("/auth/{}/{}", self.kind(), self.name())
    }

    /// Whether the login form POSTs username and password
    fn posts_credentials(&self) -> bool {
        false
    }

    /// Handle a request to the login entry point
    async fn authenticate(
        &self,
        request: LoginRequest,
        sessions: &SessionManager,
    ) -> Result<AuthOutcome>;
}

/// Result of a login attempt that did not fail
#[derive(Debug)]
pub enum AuthOutcome {
    /// Login finished; the session should be issued
    Authenticated {
        /// Newly minted session
        token: SessionToken,
        /// Where to send the browser afterwards
        target: Option<String>,
        /// Additional cookies to set, e.g. clearing handshake state
        cookies: Vec<Cookie<'static>>,
    },
    /// Login continues elsewhere, e.g. at an identity provider
    Redirect {
        /// Redirect location
        location: String,
        /// Cookies carrying handshake state
        cookies: Vec<Cookie<'static>>,
    },
}

/// The parts of a login request an authenticator may inspect
#[derive(Debug, Clone, Default)]
pub struct LoginRequest {
    /// HTTP method
    pub method: Method,
    /// Request headers
    pub headers: HeaderMap,
    /// Decoded query parameters
    pub query: HashMap<String, String>,
    /// Decoded form fields (urlencoded POST bodies only)
    pub form: HashMap<String, String>,
}

impl LoginRequest {
    /// Extract query and form parameters from an HTTP request
    pub async fn from_request(request: Request<Body>) -> Result<Self> {
        let (parts, body) = request.into_parts();
        let query = parts
            .uri
            .query()
            .map(|q| parse_urlencoded(q.as_bytes()))
            .unwrap_or_default();

        let is_form = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

        let form = if is_form {
            let bytes = axum::body::to_bytes(body, MAX_FORM_SIZE)
                .await
                .map_err(|e| Error::Protocol(format!("failed to read login form: {}", e)))?;
            parse_urlencoded(&bytes)
        } else {
            HashMap::new()
        };

        Ok(Self {
            method: parts.method,
            headers: parts.headers,
            query,
            form,
        })
    }

    /// A form field, falling back to the query string
    pub fn param(&self, name: &str) -> Option<&str> {
        self.form
            .get(name)
            .filter(|v| !v.is_empty())
            .or_else(|| self.query.get(name).filter(|v| !v.is_empty()))
            .map(String::as_str)
    }

    /// Requested post-login redirect target
    pub fn target(&self) -> Option<String> {
        self.param("target").map(str::to_string)
    }

    /// Value of a request cookie
    pub fn cookie(&self, name: &str) -> Option<String> {
        request_cookie(&self.headers, name)
    }
}

/// Find a cookie by name across every `Cookie` header
pub(crate) fn request_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(|c| c.ok())
        .find(|c| c.name() == name)
        .map(|c| c.value().to_string())
}

fn parse_urlencoded(input: &[u8]) -> HashMap<String, String> {
    url::form_urlencoded::parse(input).into_owned().collect()
}

/// Whether a redirect target stays on this origin
pub(crate) fn is_local_target(target: &str) -> bool {
    target.starts_with('/') && !target.starts_with("//") && !target.contains('\\')
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use rstest::rstest;

    #[tokio::test]
    async fn form_fields_take_precedence_over_query() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/auth/pwfile/pwfile?username=query&target=%2Fui")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("username=form&password=s3cret"))
            .unwrap();

        let login = LoginRequest::from_request(request).await.unwrap();

        assert_eq!(login.param("username"), Some("form"));
        assert_eq!(login.param("password"), Some("s3cret"));
        assert_eq!(login.target().as_deref(), Some("/ui"));
    }

    #[test]
    fn finds_cookie_among_many() {
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("a=1; oidc_state=xyz"));
        headers.append(COOKIE, HeaderValue::from_static("b=2"));
        let login = LoginRequest {
            headers,
            ..Default::default()
        };

        assert_eq!(login.cookie("oidc_state").as_deref(), Some("xyz"));
        assert_eq!(login.cookie("b").as_deref(), Some("2"));
        assert!(login.cookie("missing").is_none());
    }

    #[rstest]
    #[case::relative("/ui/pods", true)]
    #[case::root("/", true)]
    #[case::protocol_relative("//evil.example", false)]
    #[case::absolute("https://evil.example", false)]
    #[case::backslash("/\\evil.example", false)]
    fn local_targets(#[case] target: &str, #[case] expected: bool) {
        assert_eq!(is_local_target(target), expected);
    }
}
