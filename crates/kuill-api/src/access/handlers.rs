//! Permission endpoints

use std::collections::BTreeMap;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::{Extension, Json};
use serde::Deserialize;
use tracing::instrument;

use super::resolver::{AccessResolution, ResourcePermissions};
use super::resources::ResourceLists;
use crate::error::{Error, Result};
use crate::identity::AuthContext;
use crate::server::{AppState, ClientAddr};

/// Query parameters of `/proxy/_/accessreview`
#[derive(Debug, Default, Deserialize)]
pub struct AccessReviewQuery {
    /// Kind to check
    pub kind: Option<String>,
    /// Namespace, omitted for cluster scope
    pub namespace: Option<String>,
    /// Object name
    pub name: Option<String>,
}

/// `GET /proxy/_/accessreview?kind=K[&namespace=N][&name=R]`
#[instrument(skip(state, ctx), fields(user = %ctx.user))]
pub async fn access_review_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<AccessReviewQuery>,
) -> Result<Json<ResourcePermissions>> {
    let kind = query
        .kind
        .filter(|k| !k.is_empty())
        .ok_or_else(|| Error::Protocol("missing 'kind' parameter".into()))?;
    let permissions = state
        .resolver
        .permissions_for_resource(&ctx, &kind, query.namespace.as_deref(), query.name.as_deref())
        .await?;
    Ok(Json(permissions))
}

/// `GET /proxy/_/watchable`
pub async fn watchable_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Json<BTreeMap<String, AccessResolution>> {
    Json(state.resolver.watchable_resources(&ctx).await)
}

/// `GET /proxy/_/resources/list`
#[instrument(skip_all, fields(user = %ctx.user))]
pub async fn resources_list_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    client: ClientAddr,
    incoming: HeaderMap,
) -> Result<Json<ResourceLists>> {
    let mut headers = state.proxy.identity().headers_for(&ctx)?;
    state.forwarded(client.ip()).apply(&incoming, &mut headers);
    Ok(Json(state.resources.list_all(&ctx, headers).await))
}
