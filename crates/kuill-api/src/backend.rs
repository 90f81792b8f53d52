//! Backend API client
//!
//! All traffic to the Kubernetes API goes through [`BackendClient`]. The
//! client authenticates the gateway itself (client certificate and/or
//! bearer token); user identity travels in the headers the caller supplies.
//!
//! # Dependency Injection
//!
//! Handlers depend on the trait, so tests can substitute a mock backend.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use futures::{Stream, TryStreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Default connect and TLS handshake timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default TCP keep-alive interval
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// A request to the backend
#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// HTTP method
    pub method: Method,
    /// Path plus optional query, starting with `/`
    pub path_and_query: String,
    /// Headers to send, including identity headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
}

impl BackendRequest {
    /// A bodiless GET
    pub fn get(path_and_query: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method: Method::GET,
            path_and_query: path_and_query.into(),
            headers,
            body: Bytes::new(),
        }
    }

    /// A POST with a JSON body
    pub fn post_json(path: impl Into<String>, mut headers: HeaderMap, body: Vec<u8>) -> Self {
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Self {
            method: Method::POST,
            path_and_query: path.into(),
            headers,
            body: Bytes::from(body),
        }
    }
}

/// Buffered backend response
#[derive(Debug, Clone)]
pub struct BackendResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

/// Stream of body chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Streaming backend response for watch and follow queries
pub struct StreamingResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Body chunks as they arrive
    pub stream: ByteStream,
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Byte stream of an upgraded connection
pub trait UpgradedIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> UpgradedIo for T {}

/// Result of a successful upgrade handshake with the backend
pub struct UpgradedResponse {
    /// Headers of the backend's 101 response
    pub headers: HeaderMap,
    /// The upgraded connection
    pub io: Box<dyn UpgradedIo>,
}

/// HTTP client for the backend API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Send a request and buffer the response
    async fn request(&self, req: BackendRequest) -> Result<BackendResponse>;

    /// Send a request and stream the response body
    async fn request_streaming(&self, req: BackendRequest) -> Result<StreamingResponse>;

    /// Perform an HTTP/1.1 upgrade handshake
    ///
    /// Fails unless the backend answers 101 Switching Protocols.
    async fn upgrade(&self, req: BackendRequest) -> Result<UpgradedResponse>;
}

/// Backend connection settings
#[derive(Clone, Default)]
pub struct BackendConfig {
    /// Base URL, e.g. `https://kubernetes.default`
    pub url: String,
    /// CA bundle PEM trusted for the backend
    pub ca_pem: Option<Vec<u8>>,
    /// Gateway client certificate PEM
    pub client_cert_pem: Option<Vec<u8>>,
    /// Gateway client key PEM
    pub client_key_pem: Option<Zeroizing<Vec<u8>>>,
    /// Gateway bearer token
    pub bearer_token: Option<Zeroizing<String>>,
    /// Skip backend certificate verification
    pub insecure_skip_verify: bool,
    /// Connect and TLS handshake timeout
    pub connect_timeout: Option<Duration>,
    /// TCP keep-alive interval
    pub keep_alive: Option<Duration>,
}

/// Backend client using reqwest
pub struct ReqwestBackend {
    base_url: String,
    client: reqwest::Client,
    upgrade_client: reqwest::Client,
    bearer_token: Option<Zeroizing<String>>,
}

impl ReqwestBackend {
    /// Build clients from `config`
    pub fn new(config: &BackendConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(Error::Config("backend URL is required".into()));
        }

        let client = Self::builder(config)?
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;
        // Upgrades require HTTP/1.1
        let upgrade_client = Self::builder(config)?
            .http1_only()
            .build()
            .map_err(|e| Error::Config(format!("Failed to create upgrade client: {}", e)))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
            upgrade_client,
            bearer_token: config.bearer_token.clone(),
        })
    }

    fn builder(config: &BackendConfig) -> Result<reqwest::ClientBuilder> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
            .tcp_keepalive(config.keep_alive.unwrap_or(DEFAULT_KEEP_ALIVE))
            .no_proxy()
            .use_rustls_tls();

        if let Some(ca) = &config.ca_pem {
            for cert in reqwest::Certificate::from_pem_bundle(ca)
                .map_err(|e| Error::Config(format!("Invalid CA certificate: {}", e)))?
            {
                builder = builder.add_root_certificate(cert);
            }
        }

        match (&config.client_cert_pem, &config.client_key_pem) {
            (Some(cert), Some(key)) => {
                let mut pem = cert.clone();
                pem.push(b'\n');
                pem.extend_from_slice(key);
                let identity = reqwest::Identity::from_pem(&pem)
                    .map_err(|e| Error::Config(format!("Invalid client certificate: {}", e)))?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(Error::Config(
                    "client certificate and key must be configured together".into(),
                ))
            }
        }

        if config.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(builder)
    }

    fn build_request(&self, client: &reqwest::Client, req: BackendRequest) -> Result<reqwest::Request> {
        let url = format!("{}{}", self.base_url, req.path_and_query);
        let mut builder = client.request(req.method, &url).headers(req.headers);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token.as_str());
        }
        if !req.body.is_empty() {
            builder = builder.body(req.body);
        }
        builder
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build request: {}", e)))
    }
}

#[async_trait]
impl BackendClient for ReqwestBackend {
    async fn request(&self, req: BackendRequest) -> Result<BackendResponse> {
        let request = self.build_request(&self.client, req)?;
        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| Error::BackendUnavailable(format!("Failed to reach backend: {}", e)))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("Failed to read backend response: {}", e)))?;

        Ok(BackendResponse {
            status,
            headers,
            body,
        })
    }

    async fn request_streaming(&self, req: BackendRequest) -> Result<StreamingResponse> {
        let request = self.build_request(&self.client, req)?;
        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| Error::BackendUnavailable(format!("Failed to reach backend: {}", e)))?;

        let status = response.status();
        let headers = response.headers().clone();
        let stream = response.bytes_stream().map_err(std::io::Error::other);

        Ok(StreamingResponse {
            status,
            headers,
            stream: Box::pin(stream),
        })
    }

    async fn upgrade(&self, req: BackendRequest) -> Result<UpgradedResponse> {
        let request = self.build_request(&self.upgrade_client, req)?;
        let response = self
            .upgrade_client
            .execute(request)
            .await
            .map_err(|e| Error::BackendUnavailable(format!("Failed to reach backend: {}", e)))?;

        let status = response.status();
        if status != StatusCode::SWITCHING_PROTOCOLS {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            debug!(status = %status, "Backend refused upgrade");
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Forbidden(body),
                _ => Error::BackendUnavailable(format!(
                    "backend returned {} instead of 101: {}",
                    status, body
                )),
            });
        }

        let headers = response.headers().clone();
        let io = response
            .upgrade()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("Failed to upgrade backend connection: {}", e)))?;

        Ok(UpgradedResponse {
            headers,
            io: Box::new(io),
        })
    }
}

/// Hop-by-hop headers that are never forwarded
pub(crate) const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Copy `headers`, dropping hop-by-hop headers and any listed in `Connection`
pub(crate) fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<HeaderName> = headers
        .get_all(axum::http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) || listed.contains(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_and_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let out = end_to_end_headers(&headers);

        assert_eq!(out.len(), 1);
        assert_eq!(out.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn requires_backend_url() {
        assert!(ReqwestBackend::new(&BackendConfig::default()).is_err());
    }

    #[test]
    fn rejects_certificate_without_key() {
        let config = BackendConfig {
            url: "https://kubernetes.default".into(),
            client_cert_pem: Some(b"cert".to_vec()),
            ..Default::default()
        };
        assert!(ReqwestBackend::new(&config).is_err());
    }
}
