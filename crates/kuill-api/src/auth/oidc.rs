//! OpenID Connect login
//!
//! Authorization-code flow against an external identity provider:
//!
//! 1. A request without `code` is redirected to the provider. Random state
//!    (optionally suffixed with `::{target}`) is stored in an HTTP-only
//!    `oidc_state` cookie and passed as the `state` parameter.
//! 2. The provider redirects back with `code` and `state`. The state must
//!    match the cookie; the code is exchanged for tokens; the ID token is
//!    verified against the provider's JWKS, issuer, audience and nonce.
//!
//! The resulting session carries the upstream tokens as extra claims:
//! `o2a` (access token), `oid` (ID token) and `orf` (refresh token).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cookie::{Cookie, SameSite};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use rand::RngCore;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{AuthOutcome, Authenticator, LoginRequest, SessionManager};
use crate::error::{Error, Result};

/// Cookie carrying the authorization-code state
pub const OIDC_STATE_COOKIE: &str = "oidc_state";

/// Random bytes in the state parameter
const STATE_BYTES: usize = 24;

/// Separator between random state and redirect target
const TARGET_SEPARATOR: &[u8] = b"::";

/// Algorithms accepted for ID tokens
const ID_TOKEN_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// OIDC provider configuration
#[derive(Clone, Debug)]
pub struct OidcConfig {
    /// Authenticator name shown on the login page
    pub name: String,
    /// Description shown on the login page
    pub description: String,
    /// Icon URL shown on the login page
    pub icon_url: String,
    /// Provider issuer URL
    pub issuer_url: String,
    /// OAuth2 client ID
    pub client_id: String,
    /// OAuth2 client secret
    pub client_secret: Zeroizing<String>,
    /// Externally visible base URL of this gateway
    pub public_url: String,
    /// Scopes requested in addition to `openid`
    pub additional_scopes: Vec<String>,
    /// ID token claim used as the username (falls back to `sub`)
    pub user_claim: String,
    /// ID token claim holding groups
    pub groups_claim: String,
    /// JWKS refresh interval
    pub jwks_refresh_interval: Duration,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            name: "oidc".to_string(),
            description: String::new(),
            icon_url: String::new(),
            issuer_url: String::new(),
            client_id: String::new(),
            client_secret: Zeroizing::new(String::new()),
            public_url: String::new(),
            additional_scopes: Vec::new(),
            user_claim: "email".to_string(),
            groups_claim: "groups".to_string(),
            jwks_refresh_interval: Duration::from_secs(3600),
        }
    }
}

/// Provider endpoints from the discovery document
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    jwks_uri: String,
}

/// JWKS cache entry
struct JwksCache {
    /// Keys indexed by kid
    keys: HashMap<String, DecodingKey>,
    /// When the cache was last refreshed
    last_refresh: Instant,
}

/// JWKS document
#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<JwkKey>,
}

/// Individual JWK key
#[derive(Debug, Deserialize)]
struct JwkKey {
    kty: String,
    kid: Option<String>,
    n: Option<String>,
    e: Option<String>,
    crv: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    id_token: Option<String>,
    refresh_token: Option<String>,
}

/// ID token claims
#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    sub: Option<String>,
    nonce: Option<String>,
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

/// Groups claim can be array or single string
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
enum GroupsClaim {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl GroupsClaim {
    fn into_vec(self) -> Vec<String> {
        match self {
            GroupsClaim::None => vec![],
            GroupsClaim::Single(s) => s
                .split(',')
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(str::to_string)
                .collect(),
            GroupsClaim::Multiple(v) => v,
        }
    }
}

/// OIDC authorization-code login
pub struct OidcAuthenticator {
    config: OidcConfig,
    nonce: String,
    metadata: Arc<RwLock<Option<ProviderMetadata>>>,
    jwks_cache: Arc<RwLock<Option<JwksCache>>>,
    http_client: reqwest::Client,
}

impl OidcAuthenticator {
    /// Create an authenticator; provider discovery happens on first use
    pub fn new(config: OidcConfig) -> Result<Self> {
        if config.issuer_url.is_empty() || config.client_id.is_empty() {
            return Err(Error::Config("OIDC requires an issuer URL and client ID".into()));
        }
        if config.public_url.is_empty() {
            return Err(Error::Config("OIDC requires the gateway's public URL".into()));
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);

        Ok(Self {
            config,
            nonce: URL_SAFE_NO_PAD.encode(nonce),
            metadata: Arc::new(RwLock::new(None)),
            jwks_cache: Arc::new(RwLock::new(None)),
            http_client,
        })
    }

    #[cfg(test)]
    fn with_metadata(config: OidcConfig, metadata: ProviderMetadata) -> Self {
        Self {
            config,
            nonce: "test-nonce".to_string(),
            metadata: Arc::new(RwLock::new(Some(metadata))),
            jwks_cache: Arc::new(RwLock::new(None)),
            http_client: reqwest::Client::new(),
        }
    }

    fn redirect_uri(&self) -> String {
        format!(
            "{}{}",
            self.config.public_url.trim_end_matches('/'),
            self.login_url()
        )
    }

    fn state_cookie(&self, value: String) -> Cookie<'static> {
        Cookie::build((OIDC_STATE_COOKIE, value))
            .path(self.login_url())
            .http_only(true)
            .same_site(SameSite::Lax)
            .build()
    }

    /// Start the flow by redirecting to the provider
    async fn begin(&self, request: &LoginRequest) -> Result<AuthOutcome> {
        let metadata = self.metadata().await?;
        let state = encode_state(request.target().as_deref());

        let mut location = url::Url::parse(&metadata.authorization_endpoint).map_err(|e| {
            Error::Config(format!("invalid authorization endpoint: {}", e))
        })?;
        let scopes = std::iter::once("openid".to_string())
            .chain(self.config.additional_scopes.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        location
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.redirect_uri())
            .append_pair("scope", &scopes)
            .append_pair("state", &state)
            .append_pair("nonce", &self.nonce);

        Ok(AuthOutcome::Redirect {
            location: location.to_string(),
            cookies: vec![self.state_cookie(state)],
        })
    }

    /// Finish the flow with the code the provider returned
    async fn complete(
        &self,
        request: &LoginRequest,
        code: &str,
        sessions: &SessionManager,
    ) -> Result<AuthOutcome> {
        let expected = request
            .cookie(OIDC_STATE_COOKIE)
            .ok_or_else(|| Error::Protocol("missing OIDC state cookie".into()))?;
        if request.query.get("state").map(String::as_str) != Some(expected.as_str()) {
            return Err(Error::Protocol("OIDC state did not match".into()));
        }
        let target = decode_state_target(&expected)?;

        let tokens = self.exchange(code).await?;
        let raw_id_token = tokens
            .id_token
            .ok_or_else(|| Error::Unauthorized("no id_token in token response".into()))?;
        let claims = self.verify_id_token(&raw_id_token).await?;

        if claims.nonce.as_deref() != Some(self.nonce.as_str()) {
            return Err(Error::Unauthorized("invalid ID token nonce".into()));
        }

        let user = self.extract_user(&claims)?;
        let groups = self.extract_groups(&claims);

        let mut extra = Map::new();
        extra.insert("o2a".into(), Value::from(tokens.access_token));
        extra.insert("oid".into(), Value::from(raw_id_token));
        if let Some(refresh) = tokens.refresh_token {
            extra.insert("orf".into(), Value::from(refresh));
        }

        debug!(user = %user, groups = ?groups, "OIDC login complete");
        let token = sessions.new_session_token(&user, &groups, extra)?;

        let mut cleared = self.state_cookie(String::new());
        cleared.make_removal();

        Ok(AuthOutcome::Authenticated {
            token,
            target,
            cookies: vec![cleared],
        })
    }

    async fn exchange(&self, code: &str) -> Result<TokenResponse> {
        let metadata = self.metadata().await?;
        let redirect_uri = self.redirect_uri();
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let response = self
            .http_client
            .post(&metadata.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("token exchange failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Token exchange rejected");
            return Err(Error::Unauthorized(format!("token exchange returned {}", status)));
        }

        response
            .json()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("invalid token response: {}", e)))
    }

    async fn verify_id_token(&self, token: &str) -> Result<IdTokenClaims> {
        let header = decode_header(token)?;
        if !ID_TOKEN_ALGORITHMS.contains(&header.alg) {
            return Err(Error::Unauthorized(format!(
                "unexpected ID token algorithm {:?}",
                header.alg
            )));
        }

        let key = self.get_decoding_key(header.kid.as_deref()).await?;
        let metadata = self.metadata().await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&metadata.issuer]);
        validation.set_audience(&[&self.config.client_id]);
        validation.validate_exp = true;

        Ok(decode::<IdTokenClaims>(token, &key, &validation)?.claims)
    }

    fn extract_user(&self, claims: &IdTokenClaims) -> Result<String> {
        claims
            .extra
            .get(&self.config.user_claim)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| claims.sub.clone())
            .ok_or_else(|| {
                Error::Unauthorized(format!("missing claim: {}", self.config.user_claim))
            })
    }

    fn extract_groups(&self, claims: &IdTokenClaims) -> Vec<String> {
        claims
            .extra
            .get(&self.config.groups_claim)
            .cloned()
            .and_then(|v| serde_json::from_value::<GroupsClaim>(v).ok())
            .unwrap_or_default()
            .into_vec()
    }

    /// Provider metadata, fetched on first use
    async fn metadata(&self) -> Result<ProviderMetadata> {
        if let Some(metadata) = self.metadata.read().await.clone() {
            return Ok(metadata);
        }

        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            self.config.issuer_url.trim_end_matches('/')
        );
        debug!(url = %discovery_url, "Fetching OIDC discovery document");

        let metadata: ProviderMetadata = self
            .http_client
            .get(&discovery_url)
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("Failed to fetch OIDC discovery: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("Invalid OIDC discovery response: {}", e)))?;

        if metadata.issuer.trim_end_matches('/') != self.config.issuer_url.trim_end_matches('/') {
            return Err(Error::Config(format!(
                "Issuer mismatch: expected {}, got {}",
                self.config.issuer_url, metadata.issuer
            )));
        }

        *self.metadata.write().await = Some(metadata.clone());
        Ok(metadata)
    }

    /// Get decoding key from JWKS cache, refreshing if needed
    async fn get_decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey> {
        let needs_refresh = {
            let cache = self.jwks_cache.read().await;
            match &*cache {
                None => true,
                Some(c) => {
                    c.last_refresh.elapsed() > self.config.jwks_refresh_interval
                        || kid.is_some_and(|k| !c.keys.contains_key(k))
                }
            }
        };

        if needs_refresh {
            self.refresh_jwks().await?;
        }

        let cache = self.jwks_cache.read().await;
        let cache = cache
            .as_ref()
            .ok_or_else(|| Error::Internal("JWKS cache empty after refresh".into()))?;

        let key = match kid {
            Some(kid) => cache.keys.get(kid).cloned(),
            None => cache.keys.values().next().cloned(),
        };

        key.ok_or_else(|| {
            Error::Unauthorized(format!("No matching key found in JWKS for kid: {:?}", kid))
        })
    }

    /// Refresh JWKS from the provider
    async fn refresh_jwks(&self) -> Result<()> {
        let metadata = self.metadata().await?;
        debug!(url = %metadata.jwks_uri, "Fetching JWKS");

        let jwks: JwksDocument = self
            .http_client
            .get(&metadata.jwks_uri)
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("Failed to fetch JWKS: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("Invalid JWKS response: {}", e)))?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            if let Some(key) = jwk_to_decoding_key(&jwk)? {
                let kid = jwk.kid.unwrap_or_else(|| "default".to_string());
                keys.insert(kid, key);
            }
        }

        if keys.is_empty() {
            return Err(Error::Config("No usable keys found in JWKS".into()));
        }

        info!(key_count = keys.len(), "Refreshed JWKS cache");

        *self.jwks_cache.write().await = Some(JwksCache {
            keys,
            last_refresh: Instant::now(),
        });
        Ok(())
    }
}

/// Convert a JWK to a DecodingKey
fn jwk_to_decoding_key(jwk: &JwkKey) -> Result<Option<DecodingKey>> {
    let field = |value: &Option<String>, name: &str| {
        value
            .clone()
            .ok_or_else(|| Error::Config(format!("{} key missing '{}'", jwk.kty, name)))
    };
    match jwk.kty.as_str() {
        "RSA" => {
            let (n, e) = (field(&jwk.n, "n")?, field(&jwk.e, "e")?);
            DecodingKey::from_rsa_components(&n, &e)
                .map(Some)
                .map_err(|e| Error::Config(format!("Invalid RSA key: {}", e)))
        }
        "EC" => {
            let crv = field(&jwk.crv, "crv")?;
            if crv != "P-256" && crv != "P-384" {
                warn!(crv = %crv, "Unsupported EC curve");
                return Ok(None);
            }
            let (x, y) = (field(&jwk.x, "x")?, field(&jwk.y, "y")?);
            DecodingKey::from_ec_components(&x, &y)
                .map(Some)
                .map_err(|e| Error::Config(format!("Invalid EC key: {}", e)))
        }
        kty => {
            warn!(kty = %kty, "Unsupported key type");
            Ok(None)
        }
    }
}

/// Random state, suffixed with `::{target}` when a target was requested
fn encode_state(target: Option<&str>) -> String {
    let mut bytes = vec![0u8; STATE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    if let Some(target) = target.filter(|t| !t.is_empty()) {
        bytes.extend_from_slice(TARGET_SEPARATOR);
        bytes.extend_from_slice(target.as_bytes());
    }
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Recover the redirect target from a state value
fn decode_state_target(state: &str) -> Result<Option<String>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(state)
        .map_err(|e| Error::Protocol(format!("failed to decode OIDC state: {}", e)))?;
    if bytes.len() < STATE_BYTES {
        return Err(Error::Protocol("OIDC state too short".into()));
    }
    let suffix = &bytes[STATE_BYTES..];
    match suffix.strip_prefix(TARGET_SEPARATOR) {
        Some(target) => String::from_utf8(target.to_vec())
            .map(Some)
            .map_err(|_| Error::Protocol("OIDC state target is not UTF-8".into())),
        None => Ok(None),
    }
}

#[async_trait]
impl Authenticator for OidcAuthenticator {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> &str {
        "oidc"
    }

    fn description(&self) -> &str {
        if self.config.description.is_empty() {
            &self.config.name
        } else {
            &self.config.description
        }
    }

    fn icon_url(&self) -> &str {
        &self.config.icon_url
    }

    async fn authenticate(
        &self,
        request: LoginRequest,
        sessions: &SessionManager,
    ) -> Result<AuthOutcome> {
        match request.query.get("code").filter(|c| !c.is_empty()).cloned() {
            Some(code) => self.complete(&request, &code, sessions).await,
            None => self.begin(&request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{SessionConfig, SessionKey};
    use axum::http::header::COOKIE;
    use axum::http::HeaderValue;

    fn authenticator() -> OidcAuthenticator {
        let config = OidcConfig {
            name: "corp".into(),
            issuer_url: "https://idp.example.com".into(),
            client_id: "kuill".into(),
            public_url: "https://kuill.example.com/".into(),
            additional_scopes: vec!["groups".into()],
            ..Default::default()
        };
        let metadata = ProviderMetadata {
            issuer: "https://idp.example.com".into(),
            authorization_endpoint: "https://idp.example.com/authorize".into(),
            token_endpoint: "https://idp.example.com/token".into(),
            jwks_uri: "https://idp.example.com/keys".into(),
        };
        OidcAuthenticator::with_metadata(config, metadata)
    }

    fn sessions() -> SessionManager {
        SessionManager::new(SessionKey::generate(), SessionConfig::default())
    }

    #[test]
    fn state_carries_target() {
        let state = encode_state(Some("/ui/pods"));
        assert_eq!(decode_state_target(&state).unwrap().as_deref(), Some("/ui/pods"));

        let bare = encode_state(None);
        assert!(decode_state_target(&bare).unwrap().is_none());
    }

    #[test]
    fn rejects_truncated_state() {
        assert!(decode_state_target(&URL_SAFE_NO_PAD.encode(b"short")).is_err());
        assert!(decode_state_target("!!!").is_err());
    }

    #[test]
    fn requires_issuer_and_public_url() {
        assert!(OidcAuthenticator::new(OidcConfig::default()).is_err());
    }

    #[tokio::test]
    async fn login_without_code_redirects_to_provider() {
        let auth = authenticator();
        let mut request = LoginRequest::default();
        request.query.insert("target".into(), "/ui".into());

        let AuthOutcome::Redirect { location, cookies } =
            auth.authenticate(request, &sessions()).await.unwrap()
        else {
            panic!("expected redirect");
        };

        let url = url::Url::parse(&location).unwrap();
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(url.path(), "/authorize");
        assert_eq!(params["client_id"], "kuill");
        assert_eq!(params["scope"], "openid groups");
        assert_eq!(params["nonce"], "test-nonce");
        assert_eq!(
            params["redirect_uri"],
            "https://kuill.example.com/auth/oidc/corp"
        );

        let cookie = &cookies[0];
        assert_eq!(cookie.name(), OIDC_STATE_COOKIE);
        assert_eq!(cookie.value(), params["state"]);
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(
            decode_state_target(cookie.value()).unwrap().as_deref(),
            Some("/ui")
        );
    }

    #[tokio::test]
    async fn callback_without_state_cookie_is_protocol_error() {
        let mut request = LoginRequest::default();
        request.query.insert("code".into(), "abc".into());
        request.query.insert("state".into(), "xyz".into());

        let err = authenticator().authenticate(request, &sessions()).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn callback_with_mismatched_state_is_protocol_error() {
        let mut request = LoginRequest::default();
        request.query.insert("code".into(), "abc".into());
        request.query.insert("state".into(), encode_state(None));
        request.headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("{}={}", OIDC_STATE_COOKIE, encode_state(None))).unwrap(),
        );

        let err = authenticator().authenticate(request, &sessions()).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn groups_claim_accepts_string_or_array() {
        let auth = authenticator();
        let claims: IdTokenClaims = serde_json::from_value(serde_json::json!({
            "sub": "123",
            "email": "alice@example.com",
            "groups": ["dev", "ops"]
        }))
        .unwrap();
        assert_eq!(auth.extract_user(&claims).unwrap(), "alice@example.com");
        assert_eq!(auth.extract_groups(&claims), vec!["dev", "ops"]);

        let claims: IdTokenClaims = serde_json::from_value(serde_json::json!({
            "sub": "123",
            "groups": "dev, ops"
        }))
        .unwrap();
        assert_eq!(auth.extract_user(&claims).unwrap(), "123");
        assert_eq!(auth.extract_groups(&claims), vec!["dev", "ops"]);
    }
}
