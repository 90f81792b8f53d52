//! Session manager
//!
//! Issues and verifies session tokens, keeps the authenticator registry and
//! the cached login-methods document, and guards routes with
//! [`require_session`].

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use cookie::{Cookie, SameSite};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::session::{join_groups, SessionClaims, SessionConfig, SessionKey, SessionToken, RESERVED_CLAIMS, SESSION_COOKIE};
use super::{request_cookie, Authenticator};
use crate::error::{Error, Result};

/// Algorithms accepted when verifying a session
const HMAC_ALGORITHMS: &[Algorithm] = &[Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

/// Entry in the login-methods document
#[derive(Debug, Serialize)]
struct LoginMethod {
    id: String,
    name: String,
    desc: String,
    #[serde(rename = "type")]
    kind: String,
    url: String,
    icon: String,
    post_creds: bool,
}

/// Issues, verifies and renews sessions
pub struct SessionManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
    config: SessionConfig,
    authenticators: RwLock<BTreeMap<String, Arc<dyn Authenticator>>>,
    login_methods: RwLock<Arc<Vec<u8>>>,
}

impl SessionManager {
    /// Create a manager signing with `key`
    pub fn new(key: SessionKey, config: SessionConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(key.as_bytes()),
            decoding: DecodingKey::from_secret(key.as_bytes()),
            config,
            authenticators: RwLock::new(BTreeMap::new()),
            login_methods: RwLock::new(Arc::new(render_login_methods(&BTreeMap::new()))),
        }
    }

    /// Session settings
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register a login method
    ///
    /// Fails if an authenticator with the same type and name exists.
    pub async fn register_authenticator(&self, authenticator: Arc<dyn Authenticator>) -> Result<()> {
        let key = registry_key(authenticator.kind(), authenticator.name());
        let mut registry = self.authenticators.write().await;
        if registry.contains_key(&key) {
            return Err(Error::DuplicateAuthenticator(key));
        }

        info!(
            id = %key,
            url = %authenticator.login_url(),
            "Registered authenticator"
        );
        registry.insert(key, authenticator);
        *self.login_methods.write().await = Arc::new(render_login_methods(&registry));
        Ok(())
    }

    /// Look up a registered authenticator
    pub async fn authenticator(&self, kind: &str, name: &str) -> Option<Arc<dyn Authenticator>> {
        self.authenticators
            .read()
            .await
            .get(&registry_key(kind, name))
            .cloned()
    }

    /// Cached `{"login_methods":[...]}` document
    pub async fn login_methods(&self) -> Arc<Vec<u8>> {
        self.login_methods.read().await.clone()
    }

    /// Mint a session for `user`
    ///
    /// Extra claims are merged in, except those named in [`RESERVED_CLAIMS`].
    pub fn new_session_token(
        &self,
        user: &str,
        groups: &[String],
        extra: Map<String, Value>,
    ) -> Result<SessionToken> {
        self.mint_at(user, groups, extra, Utc::now())
    }

    pub(crate) fn mint_at(
        &self,
        user: &str,
        groups: &[String],
        mut extra: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<SessionToken> {
        let lifetime = chrono::Duration::from_std(self.config.lifetime)
            .map_err(|e| Error::Config(format!("invalid session lifetime: {}", e)))?;

        for reserved in RESERVED_CLAIMS {
            if extra.remove(*reserved).is_some() {
                warn!(claim = reserved, "Ignoring extra claim with reserved name");
            }
        }

        let claims = SessionClaims {
            exp: (now + lifetime).timestamp(),
            nbf: now.timestamp(),
            iat: now.timestamp(),
            csrf: uuid::Uuid::new_v4().to_string(),
            uid: user.to_string(),
            grp: join_groups(groups),
            extra,
        };
        let encoded = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(SessionToken::new(claims, encoded))
    }

    /// Read and verify the session cookie
    ///
    /// Returns `Ok(None)` when the request carries no session cookie.
    pub fn parse_session_token(&self, headers: &HeaderMap) -> Result<Option<SessionToken>> {
        match request_cookie(headers, SESSION_COOKIE) {
            Some(raw) => self.verify(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Verify a compact session token
    ///
    /// Tokens whose header names anything outside the HMAC family are
    /// rejected before any key is consulted.
    pub fn verify(&self, token: &str) -> Result<SessionToken> {
        let header = decode_header(token)?;
        if !HMAC_ALGORITHMS.contains(&header.alg) {
            return Err(Error::Unauthorized(format!(
                "unexpected session signing algorithm {:?}",
                header.alg
            )));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = HMAC_ALGORITHMS.to_vec();
        validation.validate_aud = false;
        validation.validate_nbf = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "nbf"]);

        let data = decode::<SessionClaims>(token, &self.decoding, &validation)?;
        Ok(SessionToken::new(data.claims, token.to_string()))
    }

    /// Re-mint `token` if less than the renewal threshold remains at `now`
    ///
    /// The replacement keeps the user, groups and extra claims.
    pub fn renew_if_needed(&self, token: &SessionToken, now: DateTime<Utc>) -> Result<Option<SessionToken>> {
        if token.remaining(now) >= self.config.renew_threshold {
            return Ok(None);
        }
        debug!(user = %token.user(), "Renewing session");
        self.mint_at(token.user(), &token.groups(), token.extra().clone(), now)
            .map(Some)
    }

    /// Renew `token` when it is close to expiry
    ///
    /// Returns the session to use for this request and, when renewed, the
    /// `Set-Cookie` value carrying the replacement. Failures keep the
    /// current session.
    pub fn keep_alive(&self, token: SessionToken, now: DateTime<Utc>) -> (SessionToken, Option<HeaderValue>) {
        let renewed = match self.renew_if_needed(&token, now) {
            Ok(Some(renewed)) => renewed,
            Ok(None) => return (token, None),
            Err(e) => {
                warn!(error = %e, "Failed to renew session");
                return (token, None);
            }
        };
        match self.cookie_header(&renewed) {
            Ok(value) => (renewed, Some(value)),
            Err(e) => {
                warn!(error = %e, "Failed to encode renewed session cookie");
                (token, None)
            }
        }
    }

    /// Session cookie for `token`
    pub fn session_cookie(&self, token: &SessionToken) -> Cookie<'static> {
        Cookie::build((SESSION_COOKIE, token.encoded().to_string()))
            .path("/")
            .http_only(true)
            .secure(self.config.secure_cookie)
            .same_site(SameSite::Lax)
            .build()
    }

    /// `Set-Cookie` value for `token`
    pub fn cookie_header(&self, token: &SessionToken) -> Result<HeaderValue> {
        cookie_header_value(&self.session_cookie(token))
    }
}

/// Render a cookie as a `Set-Cookie` header value
pub(crate) fn cookie_header_value(cookie: &Cookie<'_>) -> Result<HeaderValue> {
    HeaderValue::from_str(&cookie.to_string())
        .map_err(|e| Error::Internal(format!("invalid cookie value: {}", e)))
}

fn registry_key(kind: &str, name: &str) -> String {
    format!("{}:{}", kind, name)
}

fn render_login_methods(registry: &BTreeMap<String, Arc<dyn Authenticator>>) -> Vec<u8> {
    let methods: Vec<LoginMethod> = registry
        .iter()
        .map(|(id, a)| LoginMethod {
            id: id.clone(),
            name: a.name().to_string(),
            desc: a.description().to_string(),
            kind: a.kind().to_string(),
            url: a.login_url(),
            icon: a.icon_url().to_string(),
            post_creds: a.posts_credentials(),
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({ "login_methods": methods }))
        .unwrap_or_else(|_| b"{\"login_methods\":[]}".to_vec())
}

/// Middleware that requires a valid session
///
/// Responds 401 without calling the inner handler when the session is
/// missing or invalid. Otherwise renews the session if it is close to
/// expiry, inserts the [`AuthContext`](crate::AuthContext) and the
/// [`SessionToken`] as request extensions, and runs the handler.
pub async fn require_session(
    State(sessions): State<Arc<SessionManager>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match sessions.parse_session_token(request.headers()) {
        Ok(Some(token)) => token,
        Ok(None) => return Error::Unauthorized("no session".into()).into_response(),
        Err(e) => {
            debug!(error = %e, "Rejected session");
            return Error::Unauthorized("invalid session".into()).into_response();
        }
    };

    let (active, renewed_cookie) = sessions.keep_alive(token, Utc::now());

    request.extensions_mut().insert(active.context());
    request.extensions_mut().insert(active);

    let mut response = next.run(request).await;

    if let Some(value) = renewed_cookie {
        response.headers_mut().append(SET_COOKIE, value);
    }
    response
}
