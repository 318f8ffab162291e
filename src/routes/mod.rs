//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! This module binds the websocket endpoint and the HTTP API used by
//! external collaborators (history, room listing, search, uploads, ticket
//! issuance) under a single Axum router. Stored uploads are served as static
//! files under `/uploads`.

pub mod auth;
pub mod rooms;
pub mod uploads;
pub mod ws;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::services::upload::UPLOADS_URL_PREFIX;
use crate::state::AppState;

/// Multipart framing on top of the file itself.
const UPLOAD_BODY_OVERHEAD: usize = 64 * 1024;

/// Full application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let upload_body_limit = state
        .config
        .max_upload_bytes
        .saturating_add(UPLOAD_BODY_OVERHEAD);
    let uploads = Router::new()
        .route("/api/uploads", post(uploads::upload))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(upload_body_limit));

    let upload_dir = ServeDir::new(&state.config.upload_dir);

    Router::new()
        .route("/api/rooms", get(rooms::list_rooms))
        .route("/api/rooms/{id}/messages", get(rooms::room_history))
        .route("/api/rooms/{id}/search", get(rooms::room_search))
        .route("/api/ws-ticket", post(auth::ws_ticket))
        .route("/api/dev/ws-ticket", post(auth::dev_ws_ticket))
        .route("/api/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .merge(uploads)
        .nest_service(UPLOADS_URL_PREFIX, upload_dir)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
