//! Router assembly: HTTP endpoints, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;

/// Build the application router with:
/// - chat + conversation API under `/api/v1/...`
/// - CORS (allow any origin/method/headers), adjust for production if needed
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(http::http_health))
        .route("/api/v1/chat", post(http::http_post_chat))
        .route("/api/v1/session", get(http::http_get_session))
        .route("/api/v1/conversations", get(http::http_list_conversations))
        .route("/api/v1/conversations/new", post(http::http_new_conversation))
        .route(
            "/api/v1/conversations/:id",
            get(http::http_get_conversation).delete(http::http_delete_conversation),
        )
        .route("/api/v1/conversations/:id/open", post(http::http_open_conversation))
        .route("/api/v1/conversations/:id/title", post(http::http_rename_conversation))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}
