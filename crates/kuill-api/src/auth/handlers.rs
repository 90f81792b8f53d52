//! Login HTTP handlers

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_TYPE, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use cookie::Cookie;
use tracing::{debug, info, instrument};

use super::manager::cookie_header_value;
use super::{is_local_target, AuthOutcome, LoginRequest, SessionManager, SessionToken};
use crate::error::{Error, Result};

/// `GET /auth/login_methods`
pub async fn login_methods_handler(State(sessions): State<Arc<SessionManager>>) -> Response {
    let doc = sessions.login_methods().await;
    ([(CONTENT_TYPE, "application/json")], doc.as_ref().clone()).into_response()
}

/// `GET /auth/user_info`
///
/// Returns the current identity, or an empty object without a valid session.
/// A session close to expiry is renewed.
pub async fn user_info_handler(State(sessions): State<Arc<SessionManager>>, headers: HeaderMap) -> Response {
    match sessions.parse_session_token(&headers) {
        Ok(Some(token)) => {
            let (active, renewed_cookie) = sessions.keep_alive(token, Utc::now());
            let mut response = Json(user_info(&active)).into_response();
            if let Some(value) = renewed_cookie {
                response.headers_mut().append(SET_COOKIE, value);
            }
            response
        }
        Ok(None) => Json(serde_json::json!({})).into_response(),
        Err(e) => {
            debug!(error = %e, "Ignoring invalid session for user info");
            Json(serde_json::json!({})).into_response()
        }
    }
}

/// `GET|POST /auth/{type}/{name}`
#[instrument(skip(sessions, request))]
pub async fn login_handler(
    State(sessions): State<Arc<SessionManager>>,
    Path((kind, name)): Path<(String, String)>,
    request: Request<Body>,
) -> Result<Response> {
    let authenticator = sessions
        .authenticator(&kind, &name)
        .await
        .ok_or_else(|| Error::NotFound(format!("authenticator {}:{}", kind, name)))?;

    let login = LoginRequest::from_request(request).await?;
    let outcome = authenticator.authenticate(login, &sessions).await?;
    complete_login(&sessions, outcome)
}

fn user_info(token: &SessionToken) -> serde_json::Value {
    serde_json::json!({
        "user": token.user(),
        "groups": token.groups(),
        "session_expires": token.expires_at().to_rfc3339(),
    })
}

fn complete_login(sessions: &SessionManager, outcome: AuthOutcome) -> Result<Response> {
    match outcome {
        AuthOutcome::Authenticated {
            token,
            target,
            cookies,
        } => {
            info!(user = %token.user(), "Session issued");
            let mut headers = cookie_headers(&cookies)?;
            headers.append(SET_COOKIE, sessions.cookie_header(&token)?);

            match target.filter(|t| is_local_target(t)) {
                Some(target) => {
                    headers.insert(LOCATION, header(&target)?);
                    Ok((StatusCode::FOUND, headers).into_response())
                }
                None => Ok((StatusCode::OK, headers, Json(user_info(&token))).into_response()),
            }
        }
        AuthOutcome::Redirect { location, cookies } => {
            let mut headers = cookie_headers(&cookies)?;
            headers.insert(LOCATION, header(&location)?);
            Ok((StatusCode::FOUND, headers).into_response())
        }
    }
}

fn cookie_headers(cookies: &[Cookie<'static>]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for cookie in cookies {
        headers.append(SET_COOKIE, cookie_header_value(cookie)?);
    }
    Ok(headers)
}

fn header(value: &str) -> Result<axum::http::HeaderValue> {
    axum::http::HeaderValue::from_str(value)
        .map_err(|e| Error::Internal(format!("invalid header value: {}", e)))
}
