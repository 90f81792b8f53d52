//! Gateway HTTP server

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, FromRef, FromRequestParts, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::request::Parts;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use kuill_common::{KindCatalog, NamespaceSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::access::{
    access_review_handler, resources_list_handler, watchable_handler, AccessResolver, ResourceLister,
};
use crate::auth::{login_handler, login_methods_handler, require_session, user_info_handler, SessionManager};
use crate::error::{Error, Result};
use crate::proxy::{openapi_handler, proxy_handler, Forwarded, ProxyGateway};
use crate::watch::{multiwatch_register_handler, multiwatch_stream_handler, watch_all_handler, WatchAggregator};
use crate::{MULTIWATCH_PATH, PROXY_BASE_PATH};

/// Time allowed for open connections to finish on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// TLS material for the listener
#[derive(Clone)]
pub struct TlsPem {
    /// Certificate chain PEM
    pub cert_pem: Vec<u8>,
    /// Private key PEM
    pub key_pem: Vec<u8>,
}

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
    /// TLS material, or `None` to serve plain HTTP
    pub tls: Option<TlsPem>,
}

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Sessions and login methods
    pub sessions: Arc<SessionManager>,
    /// Reverse proxy to the backend
    pub proxy: Arc<ProxyGateway>,
    /// Resource kinds
    pub kinds: Arc<KindCatalog>,
    /// Namespace names
    pub namespaces: Arc<NamespaceSet>,
    /// Multi-watch aggregation
    pub aggregator: Arc<WatchAggregator>,
    /// Permission resolution
    pub resolver: Arc<AccessResolver>,
    /// Bulk resource listing
    pub resources: Arc<ResourceLister>,
    /// Whether clients reach the gateway over TLS
    pub tls: bool,
    /// Seed watch-all streams from an access precheck
    pub watch_access_precheck: bool,
}

impl AppState {
    /// Forwarding facts for a client at `client_ip`
    pub fn forwarded(&self, client_ip: Option<IpAddr>) -> Forwarded {
        Forwarded {
            client_ip,
            proto: if self.tls { "https" } else { "http" },
        }
    }
}

impl FromRef<AppState> for Arc<SessionManager> {
    fn from_ref(state: &AppState) -> Self {
        state.sessions.clone()
    }
}

/// Peer address of the client connection, when known
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub Option<SocketAddr>);

impl ClientAddr {
    /// Peer IP address
    pub fn ip(&self) -> Option<IpAddr> {
        self.0.map(|addr| addr.ip())
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        Ok(ClientAddr(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

/// Build the gateway router
///
/// Everything under the proxy base path requires a session.
pub fn build_router(state: AppState) -> Router {
    let proxied = Router::new()
        .route("/proxy/_/kinds", get(kinds_handler))
        .route("/proxy/_/namespaces", get(namespaces_handler))
        .route("/proxy/_/accessreview", get(access_review_handler))
        .route("/proxy/_/watchable", get(watchable_handler))
        .route("/proxy/_/watchall", get(watch_all_handler))
        .route("/proxy/_/resources/list", get(resources_list_handler))
        .route("/proxy/swagger.json", get(openapi_handler))
        .route(
            MULTIWATCH_PATH,
            get(multiwatch_stream_handler).post(multiwatch_register_handler),
        )
        .route(PROXY_BASE_PATH, any(proxy_handler))
        .route(&format!("{}/{{*path}}", PROXY_BASE_PATH), any(proxy_handler))
        .route_layer(middleware::from_fn_with_state(
            state.sessions.clone(),
            require_session,
        ));

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/version", get(version_handler))
        .route("/auth/login_methods", get(login_methods_handler))
        .route("/auth/user_info", get(user_info_handler))
        .route("/auth/{kind}/{name}", get(login_handler).post(login_handler))
        .merge(proxied)
        .with_state(state)
}

/// `GET /version`
async fn version_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "kuill",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /proxy/_/kinds`
async fn kinds_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.kinds.snapshot().await;
    ([(CONTENT_TYPE, "application/json")], snapshot.document().to_vec()).into_response()
}

/// `GET /proxy/_/namespaces`
async fn namespaces_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let namespaces = state.namespaces.snapshot().await;
    Json(serde_json::json!({ "namespaces": namespaces.as_slice() }))
}

/// Serve until `shutdown` is cancelled
pub async fn start_server(config: ServerConfig, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();

    match config.tls {
        Some(tls) => {
            let tls_config = RustlsConfig::from_pem(tls.cert_pem, tls.key_pem)
                .await
                .map_err(|e| Error::Config(format!("TLS config error: {}", e)))?;

            let handle = axum_server::Handle::new();
            let on_shutdown = handle.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                on_shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE));
            });

            info!(addr = %config.addr, "Starting gateway (https)");
            axum_server::bind_rustls(config.addr, tls_config)
                .handle(handle)
                .serve(app)
                .await
                .map_err(|e| Error::Internal(format!("Server error: {}", e)))?;
        }
        None => {
            warn!(addr = %config.addr, "Starting gateway over plain HTTP; session cookies are not marked secure");
            let listener = tokio::net::TcpListener::bind(config.addr)
                .await
                .map_err(|e| Error::Config(format!("failed to bind {}: {}", config.addr, e)))?;
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .map_err(|e| Error::Internal(format!("Server error: {}", e)))?;
        }
    }

    info!("Gateway stopped");
    Ok(())
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
