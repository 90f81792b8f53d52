//! Reverse and upgrade proxy to the backend API
//!
//! Requests under the proxy base path are forwarded with the base path
//! stripped. Plain requests are buffered (or streamed for watch and follow
//! queries); upgrade requests are handed to the backend as a transparent
//! HTTP upgrade and the two connections are bridged byte for byte.
//!
//! # Security
//!
//! `Cookie`, `Authorization` and every client-supplied identity header are
//! removed before forwarding. The backend only ever sees identity derived
//! from the verified session.

use std::net::IpAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Extension;
use tracing::{debug, error, info, instrument};

use crate::backend::{end_to_end_headers, BackendClient, BackendRequest, BackendResponse, StreamingResponse};
use crate::error::{Error, Result};
use crate::identity::{AuthContext, IdentityInjector};
use crate::server::{AppState, ClientAddr};

/// Largest request body buffered for the backend
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Backend path of the cluster's OpenAPI v2 document
pub const OPENAPI_PATH: &str = "/openapi/v2";

/// Headers carried over on upgrade requests
const UPGRADE_HEADERS: &[&str] = &[
    "upgrade",
    "connection",
    "content-type",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-protocol",
    "sec-websocket-extensions",
];

/// Forwarded-for header names
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Client connection facts passed on to the backend
#[derive(Debug, Clone, Copy)]
pub struct Forwarded {
    /// Peer address of the client connection
    pub client_ip: Option<IpAddr>,
    /// Scheme the client used to reach the gateway
    pub proto: &'static str,
}

impl Forwarded {
    /// Append this hop to `X-Forwarded-For` and set `X-Forwarded-Proto`
    ///
    /// `incoming` holds the client's own headers; an existing
    /// `X-Forwarded-For` chain is preserved.
    pub fn apply(&self, incoming: &HeaderMap, outbound: &mut HeaderMap) {
        let prior = incoming
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let chain = match (prior, self.client_ip) {
            (Some(prior), Some(ip)) => Some(format!("{}, {}", prior, ip)),
            (Some(prior), None) => Some(prior.to_string()),
            (None, Some(ip)) => Some(ip.to_string()),
            (None, None) => None,
        };
        if let Some(value) = chain.and_then(|c| HeaderValue::from_str(&c).ok()) {
            outbound.insert(X_FORWARDED_FOR, value);
        }
        outbound.insert(X_FORWARDED_PROTO, HeaderValue::from_static(self.proto));
    }
}

/// Whether a query string asks for a streamed response
pub(crate) fn is_streaming_query(query: &str) -> bool {
    url::form_urlencoded::parse(query.as_bytes())
        .any(|(k, v)| (k == "watch" || k == "follow") && (v == "true" || v == "1"))
}

/// Whether a request asks for an HTTP upgrade
pub(crate) fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        || headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
}

/// Identity-stamping reverse proxy
pub struct ProxyGateway {
    backend: Arc<dyn BackendClient>,
    backend_origin: HeaderValue,
    identity: IdentityInjector,
    base_path: String,
    trace_requests: bool,
}

impl ProxyGateway {
    /// Create a proxy for requests under `base_path`
    pub fn new(
        backend: Arc<dyn BackendClient>,
        backend_url: &str,
        identity: IdentityInjector,
        base_path: impl Into<String>,
    ) -> Result<Self> {
        let origin = url::Url::parse(backend_url)
            .map_err(|e| Error::Config(format!("invalid backend URL '{}': {}", backend_url, e)))?
            .origin()
            .ascii_serialization();
        let backend_origin = HeaderValue::from_str(&origin)
            .map_err(|e| Error::Config(format!("invalid backend origin: {}", e)))?;
        Ok(Self {
            backend,
            backend_origin,
            identity,
            base_path: base_path.into().trim_end_matches('/').to_string(),
            trace_requests: false,
        })
    }

    /// Log every proxied request at info level
    pub fn with_trace_requests(mut self, enabled: bool) -> Self {
        self.trace_requests = enabled;
        self
    }

    /// Identity injector used for backend requests
    pub fn identity(&self) -> &IdentityInjector {
        &self.identity
    }

    /// Backend client
    pub fn backend(&self) -> &Arc<dyn BackendClient> {
        &self.backend
    }

    /// Backend path for a gateway path, with the base path removed
    pub fn backend_path<'a>(&self, path: &'a str) -> &'a str {
        match path.strip_prefix(self.base_path.as_str()) {
            Some("") => "/",
            Some(rest) if rest.starts_with('/') => rest,
            _ => path,
        }
    }

    /// Proxy `request` to the backend as `ctx`
    pub async fn proxy_request(
        &self,
        request: Request<Body>,
        ctx: &AuthContext,
        forwarded: Forwarded,
    ) -> Result<Response<Body>> {
        let path = self.backend_path(request.uri().path()).to_string();
        let query = request.uri().query().map(str::to_string);
        let path_and_query = match &query {
            Some(q) => format!("{}?{}", path, q),
            None => path.clone(),
        };

        if self.trace_requests {
            info!(method = %request.method(), path = %path_and_query, user = %ctx.user, "Proxying request");
        } else {
            debug!(method = %request.method(), path = %path_and_query, user = %ctx.user, "Proxying request");
        }

        if is_upgrade_request(request.headers()) {
            return self.proxy_upgrade(request, path_and_query, ctx, forwarded).await;
        }

        let mut headers = end_to_end_headers(request.headers());
        headers.remove(header::HOST);
        headers.remove(header::COOKIE);
        headers.remove(header::AUTHORIZATION);
        forwarded.apply(request.headers(), &mut headers);
        self.identity.apply(&mut headers, ctx)?;

        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, MAX_BODY_SIZE)
            .await
            .map_err(|e| Error::Protocol(format!("Failed to read request body: {}", e)))?;

        let backend_request = BackendRequest {
            method: parts.method,
            path_and_query,
            headers,
            body,
        };

        if query.as_deref().is_some_and(is_streaming_query) {
            let streaming = self.backend.request_streaming(backend_request).await?;
            return build_streaming_response(streaming);
        }

        let response = self.backend.request(backend_request).await?;
        build_buffered_response(response)
    }

    /// Fetch the backend's OpenAPI document as `ctx`
    pub async fn openapi_schema(
        &self,
        incoming: &HeaderMap,
        ctx: &AuthContext,
        forwarded: Forwarded,
    ) -> Result<Response<Body>> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        forwarded.apply(incoming, &mut headers);
        self.identity.apply(&mut headers, ctx)?;

        let response = self.backend.request(BackendRequest::get(OPENAPI_PATH, headers)).await?;
        if !response.status.is_success() {
            return Err(Error::BackendUnavailable(format!(
                "OpenAPI schema returned {}",
                response.status
            )));
        }
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(response.body))
            .map_err(|e| Error::Internal(format!("Failed to build response: {}", e)))
    }

    /// Headers for a backend upgrade handshake
    ///
    /// Only the upgrade whitelist survives; `Origin` points at the backend
    /// and the user agent is blanked.
    pub(crate) fn upgrade_headers(
        &self,
        incoming: &HeaderMap,
        ctx: &AuthContext,
        forwarded: Forwarded,
    ) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for &name in UPGRADE_HEADERS {
            for value in incoming.get_all(name) {
                headers.append(HeaderName::from_static(name), value.clone());
            }
        }
        headers.insert(header::ORIGIN, self.backend_origin.clone());
        headers.insert(header::USER_AGENT, HeaderValue::from_static(""));
        forwarded.apply(incoming, &mut headers);
        self.identity.apply(&mut headers, ctx)?;
        Ok(headers)
    }

    /// Forward the upgrade handshake and bridge the upgraded connections
    async fn proxy_upgrade(
        &self,
        request: Request<Body>,
        path_and_query: String,
        ctx: &AuthContext,
        forwarded: Forwarded,
    ) -> Result<Response<Body>> {
        let headers = self.upgrade_headers(request.headers(), ctx, forwarded)?;
        let method = request.method().clone();

        // Take the client side of the upgrade before the request is dropped
        let incoming_upgrade = hyper::upgrade::on(request);

        let upstream = self
            .backend
            .upgrade(BackendRequest {
                method,
                path_and_query,
                headers,
                body: Default::default(),
            })
            .await?;

        let mut response_builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in &upstream.headers {
            response_builder = response_builder.header(name, value);
        }

        let mut upstream_io = upstream.io;
        tokio::spawn(async move {
            match incoming_upgrade.await {
                Ok(incoming_upgraded) => {
                    let mut incoming = hyper_util::rt::TokioIo::new(incoming_upgraded);
                    match tokio::io::copy_bidirectional(&mut incoming, &mut upstream_io).await {
                        Ok((from_client, from_server)) => {
                            debug!(from_client, from_server, "Upgraded session ended");
                        }
                        Err(e) => {
                            debug!(error = %e, "Upgrade bridge error");
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to upgrade incoming connection");
                }
            }
        });

        response_builder
            .body(Body::empty())
            .map_err(|e| Error::Internal(format!("Failed to build upgrade response: {}", e)))
    }
}

/// Build a streaming response for watch/follow queries
fn build_streaming_response(response: StreamingResponse) -> Result<Response<Body>> {
    debug!(status = %response.status, "Starting streaming response");

    let mut builder = Response::builder().status(response.status);
    for (name, value) in end_to_end_headers(&response.headers).iter() {
        if name != header::CONTENT_LENGTH {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from_stream(response.stream))
        .map_err(|e| Error::Internal(format!("Failed to build streaming response: {}", e)))
}

/// Build a buffered response for regular (non-streaming) requests
fn build_buffered_response(response: BackendResponse) -> Result<Response<Body>> {
    debug!(
        status = %response.status,
        body_len = response.body.len(),
        "Received response from backend"
    );

    let mut builder = Response::builder().status(response.status);
    for (name, value) in end_to_end_headers(&response.headers).iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(response.body))
        .map_err(|e| Error::Internal(format!("Failed to build response: {}", e)))
}

/// `ANY /proxy/{*path}`
#[instrument(skip(state, ctx, client, request), fields(user = %ctx.user))]
pub async fn proxy_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    client: ClientAddr,
    request: Request<Body>,
) -> Result<Response<Body>> {
    let forwarded = state.forwarded(client.ip());
    state.proxy.proxy_request(request, &ctx, forwarded).await
}

/// `GET /proxy/swagger.json`
#[instrument(skip(state, ctx, client, headers), fields(user = %ctx.user))]
pub async fn openapi_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    client: ClientAddr,
    headers: HeaderMap,
) -> Result<Response<Body>> {
    let forwarded = state.forwarded(client.ip());
    state.proxy.openapi_schema(&headers, &ctx, forwarded).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackendClient;
    use crate::identity::IdentityMode;
    use axum::body::Bytes;
    use rstest::rstest;

    fn gateway(backend: MockBackendClient) -> ProxyGateway {
        ProxyGateway::new(
            Arc::new(backend),
            "https://kubernetes.default:6443",
            IdentityInjector::new(IdentityMode::Impersonation, vec!["system:authenticated".into()]),
            "/proxy",
        )
        .unwrap()
    }

    fn alice() -> AuthContext {
        AuthContext::new("alice", ["dev"])
    }

    fn forwarded() -> Forwarded {
        Forwarded {
            client_ip: Some("10.0.0.7".parse().unwrap()),
            proto: "https",
        }
    }

    #[rstest]
    #[case::nested("/proxy/api/v1/pods", "/api/v1/pods")]
    #[case::bare("/proxy", "/")]
    #[case::prefix_only_match("/proxyish/api", "/proxyish/api")]
    fn strips_base_path(#[case] input: &str, #[case] expected: &str) {
        let gw = gateway(MockBackendClient::new());
        assert_eq!(gw.backend_path(input), expected);
    }

    #[rstest]
    #[case::watch("watch=true", true)]
    #[case::watch_numeric("labelSelector=a&watch=1", true)]
    #[case::follow("follow=true&container=x", true)]
    #[case::list("limit=500", false)]
    #[case::watch_false("watch=false", false)]
    fn detects_streaming_queries(#[case] query: &str, #[case] expected: bool) {
        assert_eq!(is_streaming_query(query), expected);
    }

    #[tokio::test]
    async fn forwards_with_identity_and_without_credentials() {
        let mut backend = MockBackendClient::new();
        backend
            .expect_request()
            .withf(|req| {
                req.path_and_query == "/api/v1/namespaces/default/pods?limit=10"
                    && req.headers.get("impersonate-user").unwrap() == "alice"
                    && req.headers.get_all("impersonate-group").iter().count() == 2
                    && req.headers.get("cookie").is_none()
                    && req.headers.get("authorization").is_none()
                    && req.headers.get("x-forwarded-for").unwrap() == "10.0.0.7"
                    && req.headers.get("x-forwarded-proto").unwrap() == "https"
                    && req.headers.get("accept").unwrap() == "application/json"
            })
            .times(1)
            .returning(|_| {
                let mut headers = HeaderMap::new();
                headers.insert("content-type", HeaderValue::from_static("application/json"));
                Ok(BackendResponse {
                    status: StatusCode::OK,
                    headers,
                    body: Bytes::from_static(b"{\"items\":[]}"),
                })
            });

        let request = Request::builder()
            .uri("/proxy/api/v1/namespaces/default/pods?limit=10")
            .header("cookie", "kuill=abc")
            .header("authorization", "Bearer stolen")
            .header("impersonate-user", "admin")
            .header("accept", "application/json")
            .body(Body::empty())
            .unwrap();

        let response = gateway(backend)
            .proxy_request(request, &alice(), forwarded())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"{\"items\":[]}");
    }

    #[tokio::test]
    async fn backend_status_is_passed_through() {
        let mut backend = MockBackendClient::new();
        backend.expect_request().returning(|_| {
            Ok(BackendResponse {
                status: StatusCode::FORBIDDEN,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            })
        });

        let request = Request::builder()
            .uri("/proxy/api/v1/secrets")
            .body(Body::empty())
            .unwrap();
        let response = gateway(backend)
            .proxy_request(request, &alice(), forwarded())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn watch_queries_stream() {
        let mut backend = MockBackendClient::new();
        backend.expect_request().never();
        backend.expect_request_streaming().times(1).returning(|_| {
            let chunks = futures::stream::iter(vec![
                Ok(Bytes::from_static(b"{\"type\":\"ADDED\"}\n")),
                Ok(Bytes::from_static(b"{\"type\":\"DELETED\"}\n")),
            ]);
            Ok(StreamingResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                stream: Box::pin(chunks),
            })
        });

        let request = Request::builder()
            .uri("/proxy/api/v1/pods?watch=true")
            .body(Body::empty())
            .unwrap();
        let response = gateway(backend)
            .proxy_request(request, &alice(), forwarded())
            .await
            .unwrap();

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"{\"type\":\"ADDED\"}\n{\"type\":\"DELETED\"}\n");
    }

    #[tokio::test]
    async fn backend_unavailable_fails_request() {
        let mut backend = MockBackendClient::new();
        backend
            .expect_request()
            .returning(|_| Err(Error::BackendUnavailable("connection refused".into())));

        let request = Request::builder()
            .uri("/proxy/api/v1/pods")
            .body(Body::empty())
            .unwrap();
        let err = gateway(backend)
            .proxy_request(request, &alice(), forwarded())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::BackendUnavailable(_)));
    }

    #[test]
    fn upgrade_headers_are_whitelisted() {
        let gw = gateway(MockBackendClient::new());
        let mut incoming = HeaderMap::new();
        incoming.insert("upgrade", HeaderValue::from_static("websocket"));
        incoming.insert("connection", HeaderValue::from_static("Upgrade"));
        incoming.insert("sec-websocket-key", HeaderValue::from_static("dGhlIHNhbXBsZQ=="));
        incoming.insert("sec-websocket-protocol", HeaderValue::from_static("v4.channel.k8s.io"));
        incoming.insert("origin", HeaderValue::from_static("https://ui.example.com"));
        incoming.insert("user-agent", HeaderValue::from_static("Mozilla/5.0"));
        incoming.insert("cookie", HeaderValue::from_static("kuill=abc"));

        let headers = gw.upgrade_headers(&incoming, &alice(), forwarded()).unwrap();

        assert!(is_upgrade_request(&incoming));
        assert_eq!(headers.get("upgrade").unwrap(), "websocket");
        assert_eq!(headers.get("sec-websocket-protocol").unwrap(), "v4.channel.k8s.io");
        assert_eq!(headers.get("origin").unwrap(), "https://kubernetes.default:6443");
        assert_eq!(headers.get("user-agent").unwrap(), "");
        assert!(headers.get("cookie").is_none());
        assert_eq!(headers.get("impersonate-user").unwrap(), "alice");
    }

    #[test]
    fn forwarded_for_extends_existing_chain() {
        let mut incoming = HeaderMap::new();
        incoming.insert(X_FORWARDED_FOR, HeaderValue::from_static("192.0.2.1"));
        let mut outbound = HeaderMap::new();

        forwarded().apply(&incoming, &mut outbound);

        assert_eq!(outbound.get(X_FORWARDED_FOR).unwrap(), "192.0.2.1, 10.0.0.7");
    }
}
