//! Auth routes: session-backed WS ticket issuance.

use axum::extract::{FromRef, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::response::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::Deserialize;
use tracing::{error, info};

use crate::services::session;
use crate::state::AppState;
use crate::store::Identity;

const COOKIE_NAME: &str = "session_token";
const MAX_USERNAME_LEN: usize = 64;

// =============================================================================
// AUTH EXTRACTOR
// =============================================================================

/// Authenticated user resolved from the session cookie or a bearer token.
/// Use as a handler parameter to require authentication.
pub struct AuthUser {
    pub identity: Identity,
}

fn session_token(parts: &axum::http::request::Parts) -> Option<String> {
    let jar = CookieJar::from_headers(&parts.headers);
    if let Some(token) = jar.get(COOKIE_NAME).map(Cookie::value) {
        if !token.is_empty() {
            return Some(token.to_owned());
        }
    }
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty())
}

impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut axum::http::request::Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = session_token(parts).ok_or(StatusCode::UNAUTHORIZED)?;

        let app_state = AppState::from_ref(state);
        let identity = session::session_identity(app_state.store.as_ref(), &token)
            .await
            .map_err(|e| {
                error!(error = %e, "session lookup failed");
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .ok_or(StatusCode::UNAUTHORIZED)?;

        Ok(Self { identity })
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

/// `POST /api/ws-ticket`: create a one-time WS ticket for the session user.
pub async fn ws_ticket(State(state): State<AppState>, auth: AuthUser) -> Result<Json<serde_json::Value>, StatusCode> {
    let user_id = auth.identity.user_id.ok_or(StatusCode::UNAUTHORIZED)?;
    let ticket = session::issue_ws_ticket(state.store.as_ref(), user_id)
        .await
        .map_err(|e| {
            error!(error = %e, "ws ticket issue failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(serde_json::json!({ "ticket": ticket })))
}

#[derive(Deserialize)]
pub struct DevTicketBody {
    pub username: String,
}

/// `POST /api/dev/ws-ticket`: local-development ticket bootstrap without a session.
///
/// Enabled only when `CHAT_DEV_AUTH_BYPASS=true`. Creates the user if missing.
pub async fn dev_ws_ticket(
    State(state): State<AppState>,
    Json(body): Json<DevTicketBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if !state.config.dev_auth_bypass {
        return Err(StatusCode::NOT_FOUND);
    }

    let username = body.username.trim();
    if username.is_empty() || username.len() > MAX_USERNAME_LEN {
        return Err(StatusCode::BAD_REQUEST);
    }

    let identity = state.store.upsert_user(username).await.map_err(|e| {
        error!(error = %e, "dev user upsert failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let user_id = identity.user_id.ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

    let ticket = session::issue_ws_ticket(state.store.as_ref(), user_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    info!(username, "dev ws ticket issued");

    Ok(Json(serde_json::json!({ "ticket": ticket })))
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
