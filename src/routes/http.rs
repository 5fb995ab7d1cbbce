//! HTTP endpoint handlers. These are thin wrappers that forward to the
//! learner's session task. Each handler is instrumented and logs ids and sizes.
//!
//! Every route except health is scoped to the learner named by `X-User-Id`.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{info, instrument, warn};

use crate::domain::ImageRef;
use crate::error::{GenerationError, PipelineError, StoreError};
use crate::protocol::*;
use crate::state::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated learner id taken from the `X-User-Id` header.
pub struct Owner(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| Owner(id.to_string()))
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "missing X-User-Id header"))
    }
}

/// JSON error body with a status picked from the error kind.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        let status = match &e {
            PipelineError::EmptyPrompt | PipelineError::InvalidImage(_) => StatusCode::BAD_REQUEST,
            PipelineError::QueueFull { .. } | PipelineError::RateLimitExhausted { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            PipelineError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::Backend(_) => StatusCode::BAD_GATEWAY,
            PipelineError::Discarded => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Store(s) => return s.clone().into(),
            PipelineError::SessionClosed => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Transport and decode details stay in the server log.
        if let PipelineError::Backend(GenerationError::Transport(_) | GenerationError::Malformed(_)) = &e {
            return Self::new(status, "failed to get a response from the AI assistant");
        }
        Self::new(status, e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(target: "studyquest", status = %self.status, error = %self.message, "Request failed");
        }
        (self.status, Json(ErrorOut { error: self.message })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[instrument(level = "info", skip(state))]
pub async fn http_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthOut { ok: true, backend: state.backend.name() })
}

#[instrument(level = "info", skip(state, owner, body), fields(owner_id = %owner.0, prompt_len = body.prompt.len(), has_image = body.image.is_some()))]
pub async fn http_post_chat(
    State(state): State<Arc<AppState>>,
    owner: Owner,
    Json(body): Json<ChatIn>,
) -> ApiResult<ChatOut> {
    let image = body
        .image
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(ImageRef::parse)
        .transpose()
        .map_err(PipelineError::from)?;
    let reply = state.session(&owner.0).await.submit(body.prompt, image).await?;
    info!(target: "studyquest", owner_id = %owner.0, reply_len = reply.message.text.len(), "Chat reply served");
    Ok(Json(reply.into()))
}

#[instrument(level = "info", skip(state, owner), fields(owner_id = %owner.0))]
pub async fn http_get_session(State(state): State<Arc<AppState>>, owner: Owner) -> ApiResult<SessionOut> {
    let snap = state.session(&owner.0).await.snapshot().await?;
    Ok(Json(snap.into()))
}

#[instrument(level = "info", skip(state, owner), fields(owner_id = %owner.0))]
pub async fn http_new_conversation(State(state): State<Arc<AppState>>, owner: Owner) -> ApiResult<SessionOut> {
    let snap = state.session(&owner.0).await.new_conversation().await?;
    Ok(Json(snap.into()))
}

#[instrument(level = "info", skip(state, owner), fields(owner_id = %owner.0))]
pub async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    owner: Owner,
) -> ApiResult<Vec<ConversationSummaryOut>> {
    let list = state.session(&owner.0).await.list().await?;
    info!(target: "studyquest", owner_id = %owner.0, count = list.len(), "Conversations listed");
    Ok(Json(list.iter().map(to_summary).collect()))
}

#[instrument(level = "info", skip(state, owner), fields(owner_id = %owner.0, %id))]
pub async fn http_get_conversation(
    State(state): State<Arc<AppState>>,
    owner: Owner,
    Path(id): Path<String>,
) -> ApiResult<crate::domain::Conversation> {
    Ok(Json(state.session(&owner.0).await.get(id).await?))
}

#[instrument(level = "info", skip(state, owner), fields(owner_id = %owner.0, %id))]
pub async fn http_open_conversation(
    State(state): State<Arc<AppState>>,
    owner: Owner,
    Path(id): Path<String>,
) -> ApiResult<SessionOut> {
    let snap = state.session(&owner.0).await.open(id).await?;
    Ok(Json(snap.into()))
}

#[instrument(level = "info", skip(state, owner), fields(owner_id = %owner.0, %id))]
pub async fn http_delete_conversation(
    State(state): State<Arc<AppState>>,
    owner: Owner,
    Path(id): Path<String>,
) -> ApiResult<DeleteOut> {
    state.session(&owner.0).await.delete(id).await?;
    Ok(Json(DeleteOut { success: true }))
}

/// Body is optional: `{}` or no `title` regenerates the title from the messages.
#[instrument(level = "info", skip(state, owner, body), fields(owner_id = %owner.0, %id))]
pub async fn http_rename_conversation(
    State(state): State<Arc<AppState>>,
    owner: Owner,
    Path(id): Path<String>,
    body: Option<Json<RenameIn>>,
) -> ApiResult<ConversationSummaryOut> {
    let title = body.and_then(|Json(b)| b.title);
    let conv = state.session(&owner.0).await.rename(id, title).await?;
    info!(target: "studyquest", id = %conv.id, title = %conv.title, "Conversation renamed");
    Ok(Json(to_summary(&conv)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::routes::build_router;
    use crate::store::MemoryStore;
    use crate::testing::ScriptedBackend;
    use axum::{
        body::{to_bytes, Body},
        http::Request,
        Router,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        let state = AppState::with_parts(
            AppConfig::default(),
            ScriptedBackend::new(vec![]),
            Arc::new(MemoryStore::new()),
        );
        build_router(Arc::new(state))
    }

    async fn call(app: &Router, method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            req = req.header(USER_ID_HEADER, user);
        }
        let req = match body {
            Some(b) => req
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, value)
    }

    #[tokio::test]
    async fn health_needs_no_user() {
        let (status, body) = call(&app(), "GET", "/api/v1/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true, "backend": "scripted" }));
    }

    #[tokio::test]
    async fn missing_or_blank_user_is_unauthorized() {
        let app = app();
        let (status, body) = call(&app, "GET", "/api/v1/conversations", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("X-User-Id"));

        let (status, _) = call(&app, "POST", "/api/v1/chat", Some("  "), Some(json!({ "prompt": "hi" }))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn chat_then_list_open_and_delete() {
        let app = app();
        let (status, body) = call(&app, "POST", "/api/v1/chat", Some("ana"), Some(json!({ "prompt": "Explain recursion" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"]["role"], "assistant");
        assert_eq!(body["message"]["text"], "echo: Explain recursion");

        let (_, session) = call(&app, "GET", "/api/v1/session", Some("ana"), None).await;
        let id = session["conversationId"].as_str().unwrap().to_string();
        assert_eq!(session["title"], "Recursion Basics");
        assert_eq!(session["messages"].as_array().unwrap().len(), 2);

        let (_, list) = call(&app, "GET", "/api/v1/conversations", Some("ana"), None).await;
        assert_eq!(list[0]["id"], id.as_str());
        assert_eq!(list[0]["messageCount"], 2);

        let (_, other) = call(&app, "GET", "/api/v1/conversations", Some("ben"), None).await;
        assert_eq!(other, json!([]));
        let (status, _) = call(&app, "GET", &format!("/api/v1/conversations/{}", id), Some("ben"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, renamed) = call(
            &app,
            "POST",
            &format!("/api/v1/conversations/{}/title", id),
            Some("ana"),
            Some(json!({ "title": "Recursion 101" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(renamed["title"], "Recursion 101");

        let (_, fresh) = call(&app, "POST", "/api/v1/conversations/new", Some("ana"), None).await;
        assert!(fresh["conversationId"].is_null());
        let (_, opened) = call(&app, "POST", &format!("/api/v1/conversations/{}/open", id), Some("ana"), None).await;
        assert_eq!(opened["title"], "Recursion 101");

        let (status, deleted) = call(&app, "DELETE", &format!("/api/v1/conversations/{}", id), Some("ana"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted, json!({ "success": true }));

        let (_, list) = call(&app, "GET", "/api/v1/conversations", Some("ana"), None).await;
        assert_eq!(list, json!([]));
        let (status, _) = call(&app, "GET", &format!("/api/v1/conversations/{}", id), Some("ana"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_input_is_rejected() {
        let app = app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/chat",
            Some("ana"),
            Some(json!({ "prompt": "what is this", "image": "https://example.com/cat.png" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("invalid image"));

        let (status, _) = call(&app, "POST", "/api/v1/chat", Some("ana"), Some(json!({ "prompt": "   " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn error_statuses() {
        let status = |e: PipelineError| ApiError::from(e).status;
        assert_eq!(status(PipelineError::QueueFull { limit: 8 }), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status(PipelineError::RateLimitExhausted { attempts: 3 }), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status(PipelineError::TimedOut(std::time::Duration::from_secs(30))), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status(PipelineError::Backend(GenerationError::Malformed("x".into()))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(status(PipelineError::Discarded), StatusCode::SERVICE_UNAVAILABLE);

        let transport = ApiError::from(PipelineError::Backend(GenerationError::Transport(
            "error sending request for url (http://x/y?key=abc)".into(),
        )));
        assert_eq!(transport.status, StatusCode::BAD_GATEWAY);
        assert_eq!(transport.message, "failed to get a response from the AI assistant");
        assert_eq!(status(StoreError::Unavailable("db".into()).into()), StatusCode::SERVICE_UNAVAILABLE);
    }
}
