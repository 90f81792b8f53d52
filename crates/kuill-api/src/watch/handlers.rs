//! Multi-watch HTTP endpoints

use std::collections::HashSet;

use axum::body::Bytes;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::header::{CONTENT_TYPE, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use kuill_common::KindSnapshot;
use tracing::{debug, info, instrument};

use super::dialer::WatchTarget;
use super::protocol::{CorrelationTokens, WatchSpec};
use crate::auth::cookie_header_value;
use crate::error::{Error, Result};
use crate::identity::AuthContext;
use crate::server::{AppState, ClientAddr};
use crate::MULTIWATCH_PATH;

/// `POST /proxy/multiwatch`: register a watch specification
///
/// Answers 201 with the correlation cookies and no body.
#[instrument(skip_all)]
pub async fn multiwatch_register_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("application/json"));
    if !is_json {
        return Err(Error::UnsupportedMediaType(
            "watch registration must be application/json".into(),
        ));
    }

    let spec: WatchSpec = serde_json::from_slice(&body)?;
    spec.validate()?;
    let cookies = CorrelationTokens::encode(&spec).to_cookies(MULTIWATCH_PATH, state.tls)?;
    debug!(watches = spec.watches.len(), "Registered multi-watch");

    let mut response = StatusCode::CREATED.into_response();
    for cookie in &cookies {
        response
            .headers_mut()
            .append(SET_COOKIE, cookie_header_value(cookie)?);
    }
    Ok(response)
}

/// `GET /proxy/multiwatch` with Upgrade: stream the registered watches
#[instrument(skip_all, fields(user = %ctx.user))]
pub async fn multiwatch_stream_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    client: ClientAddr,
    headers: HeaderMap,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response> {
    let spec = CorrelationTokens::from_headers(&headers)?.decode()?;
    let targets = resolve_targets(&spec, &*state.kinds.snapshot().await)?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    info!(sources = targets.len(), "Starting multi-watch");
    stream(&state, &ctx, client, &headers, ws, targets).await
}

/// `GET /proxy/_/watchall` with Upgrade: stream every watchable kind
#[instrument(skip_all, fields(user = %ctx.user))]
pub async fn watch_all_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    client: ClientAddr,
    headers: HeaderMap,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response> {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let kinds = state.kinds.snapshot().await;
    let targets = if state.watch_access_precheck {
        let watchable = state.resolver.watchable_resources(&ctx).await;
        let mut targets = Vec::new();
        for (name, resolution) in watchable {
            let Some(kind) = kinds.get(&name) else { continue };
            if resolution.cluster_wide {
                targets.push(WatchTarget::cluster(kind, ""));
            } else {
                targets.extend(
                    resolution
                        .namespaces
                        .into_iter()
                        .map(|ns| WatchTarget::namespaced(kind.clone(), ns, "")),
                );
            }
        }
        targets
    } else {
        kinds
            .watchable()
            .into_iter()
            .map(|kind| WatchTarget::cluster(kind, ""))
            .collect()
    };

    info!(
        sources = targets.len(),
        precheck = state.watch_access_precheck,
        "Starting watch of all kinds"
    );
    stream(&state, &ctx, client, &headers, ws, targets).await
}

async fn stream(
    state: &AppState,
    ctx: &AuthContext,
    client: ClientAddr,
    incoming: &HeaderMap,
    ws: WebSocketUpgrade,
    targets: Vec<WatchTarget>,
) -> Result<Response> {
    if targets.is_empty() {
        return Err(Error::Protocol("nothing to watch".into()));
    }

    let mut headers = state.proxy.identity().headers_for(ctx)?;
    state.forwarded(client.ip()).apply(incoming, &mut headers);

    let aggregated = state.aggregator.connect(targets, headers).await?;
    Ok(ws.on_upgrade(move |socket| aggregated.run(socket)))
}

/// Backend watches for a decoded specification
///
/// Each kind is watched once per namespace, or once at cluster scope when no
/// namespaces are given or the kind is not namespaced.
pub fn resolve_targets(spec: &WatchSpec, kinds: &KindSnapshot) -> Result<Vec<WatchTarget>> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for watch in &spec.watches {
        let kind = kinds
            .get(&watch.kind)
            .ok_or_else(|| Error::Protocol(format!("unknown kind '{}'", watch.kind)))?;
        if !kind.is_watchable() {
            return Err(Error::Protocol(format!("kind '{}' cannot be watched", watch.kind)));
        }

        if watch.namespaces.is_empty() || !kind.namespaced {
            if seen.insert((kind.kind.clone(), None)) {
                targets.push(WatchTarget::cluster(kind.clone(), watch.resource_revision.clone()));
            }
            continue;
        }
        for ns in &watch.namespaces {
            if seen.insert((kind.kind.clone(), Some(ns.clone()))) {
                targets.push(WatchTarget::namespaced(
                    kind.clone(),
                    ns.clone(),
                    watch.resource_revision.clone(),
                ));
            }
        }
    }
    Ok(targets)
}
