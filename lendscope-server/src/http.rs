//! Lendscope HTTP REST API
//!
//! Each endpoint has a thin axum handler that resolves the caller from the
//! bearer token and delegates to an inner function returning
//! `(StatusCode, body)`. The inner functions build a `LendRequest` and go
//! through the shared router, so HTTP and in-process callers behave the same.
//!
//! Endpoints:
//! - GET  /health                   health check with storage status
//! - GET  /version                  server version info
//! - POST /chat                     one chat turn
//! - POST /upload                   raw document body, `x-filename` header
//! - POST /upload_chat              follow-up turn on an upload session
//! - GET  /sessions                 the caller's sessions
//! - GET  /session                  one session, warming the cache
//! - POST /update_message_feedback  feedback and rating for one message
//! - POST /update_session_title     rename a session

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use lendscope_core::api::{ErrorCode, LendRequest, LendResponse, PROTOCOL_VERSION};
use lendscope_core::models::SessionKind;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::auth::Authenticator;
use crate::router::handle_request;
use crate::services::Services;

pub const FILENAME_HEADER: &str = "x-filename";
pub const SESSION_HEADER: &str = "x-session-id";

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub services: Arc<Services>,
    pub auth: Authenticator,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    let upload_limit = state.services.config.http.max_upload_bytes;
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/chat", post(chat_handler))
        .route("/upload", post(upload_handler).layer(DefaultBodyLimit::max(upload_limit)))
        .route("/upload_chat", post(upload_chat_handler))
        .route("/sessions", get(sessions_handler))
        .route("/session", get(session_handler))
        .route("/update_message_feedback", post(feedback_handler))
        .route("/update_session_title", post(title_handler))
        .with_state(state)
}

/// Serve on the configured address until the shutdown signal fires.
pub async fn start_http_server(state: Arc<HttpState>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let addr = format!("{}:{}", state.services.config.http.host, state.services.config.http.port);
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Lendscope HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadChatRequest {
    pub session_id: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SessionsQuery {
    pub limit: Option<usize>,
    pub kind: Option<SessionKind>,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub session_id: Option<String>,
    pub message_index: usize,
    pub feedback: Option<String>,
    pub rating: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct TitleRequest {
    pub session_id: Option<String>,
    pub title: Option<String>,
}

// ============================================================================
// Inner (directly testable) functions
// ============================================================================

pub async fn health_inner(services: &Services) -> (StatusCode, Value) {
    let response = handle_request(LendRequest::Health, services).await;
    if response.is_ok() {
        let mut data = response.data.unwrap_or_else(|| json!({}));
        if let Some(obj) = data.as_object_mut() {
            obj.insert("version".to_string(), json!(env!("CARGO_PKG_VERSION")));
        }
        (StatusCode::OK, data)
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({
                "status": "unhealthy",
                "error": response.error,
            }),
        )
    }
}

/// Version info (pure, no IO).
pub fn version_inner() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION,
    })
}

pub async fn chat_inner(state: &HttpState, authorization: Option<&str>, req: ChatRequest) -> (StatusCode, Value) {
    let user_id = match authenticate(state, authorization) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let Some(message) = req.message.filter(|m| !m.trim().is_empty()) else {
        return error_body(StatusCode::BAD_REQUEST, "message field is required");
    };

    let start = Instant::now();
    let request = LendRequest::Chat {
        user_id,
        session_id: req.session_id.filter(|s| !s.trim().is_empty()),
        message,
    };
    let (status, mut body) = response_to_http(handle_request(request, &state.services).await);
    if status == StatusCode::OK {
        if let Some(obj) = body.as_object_mut() {
            obj.insert("took_ms".to_string(), json!(start.elapsed().as_millis() as u64));
        }
    }
    (status, body)
}

pub async fn upload_inner(
    state: &HttpState,
    authorization: Option<&str>,
    filename: Option<&str>,
    session_id: Option<&str>,
    body: Bytes,
) -> (StatusCode, Value) {
    let user_id = match authenticate(state, authorization) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let Some(filename) = filename.map(str::trim).filter(|f| !f.is_empty()) else {
        return error_body(StatusCode::BAD_REQUEST, "x-filename header is required");
    };

    let request = LendRequest::Upload {
        user_id,
        session_id: session_id.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string),
        filename: filename.to_string(),
        content: body.to_vec(),
    };
    response_to_http(handle_request(request, &state.services).await)
}

pub async fn upload_chat_inner(
    state: &HttpState,
    authorization: Option<&str>,
    req: UploadChatRequest,
) -> (StatusCode, Value) {
    let user_id = match authenticate(state, authorization) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let Some(session_id) = req.session_id.filter(|s| !s.trim().is_empty()) else {
        return error_body(StatusCode::BAD_REQUEST, "session_id field is required");
    };
    let Some(message) = req.message.filter(|m| !m.trim().is_empty()) else {
        return error_body(StatusCode::BAD_REQUEST, "message field is required");
    };

    let request = LendRequest::UploadChat {
        user_id,
        session_id,
        message,
    };
    response_to_http(handle_request(request, &state.services).await)
}

pub async fn sessions_inner(
    state: &HttpState,
    authorization: Option<&str>,
    query: SessionsQuery,
) -> (StatusCode, Value) {
    let user_id = match authenticate(state, authorization) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let request = LendRequest::ListSessions {
        user_id,
        kind: query.kind,
        limit: query.limit,
    };
    response_to_http(handle_request(request, &state.services).await)
}

pub async fn session_inner(state: &HttpState, authorization: Option<&str>, query: SessionQuery) -> (StatusCode, Value) {
    let user_id = match authenticate(state, authorization) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let Some(session_id) = query.session_id.filter(|s| !s.trim().is_empty()) else {
        return error_body(StatusCode::BAD_REQUEST, "session_id is required");
    };
    response_to_http(handle_request(LendRequest::GetSession { user_id, session_id }, &state.services).await)
}

pub async fn feedback_inner(
    state: &HttpState,
    authorization: Option<&str>,
    req: FeedbackRequest,
) -> (StatusCode, Value) {
    let user_id = match authenticate(state, authorization) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let Some(session_id) = req.session_id.filter(|s| !s.trim().is_empty()) else {
        return error_body(StatusCode::BAD_REQUEST, "session_id field is required");
    };
    let request = LendRequest::UpdateFeedback {
        user_id,
        session_id,
        message_index: req.message_index,
        feedback: req.feedback,
        rating: req.rating,
    };
    response_to_http(handle_request(request, &state.services).await)
}

pub async fn title_inner(state: &HttpState, authorization: Option<&str>, req: TitleRequest) -> (StatusCode, Value) {
    let user_id = match authenticate(state, authorization) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let Some(session_id) = req.session_id.filter(|s| !s.trim().is_empty()) else {
        return error_body(StatusCode::BAD_REQUEST, "session_id field is required");
    };
    let request = LendRequest::UpdateTitle {
        user_id,
        session_id,
        title: req.title.unwrap_or_default(),
    };
    response_to_http(handle_request(request, &state.services).await)
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.services).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn chat_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> impl IntoResponse {
    let (status, body) = chat_inner(&state, header_str(&headers, header::AUTHORIZATION.as_str()), req).await;
    (status, Json(body))
}

pub async fn upload_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let (status, body) = upload_inner(
        &state,
        header_str(&headers, header::AUTHORIZATION.as_str()),
        header_str(&headers, FILENAME_HEADER),
        header_str(&headers, SESSION_HEADER),
        body,
    )
    .await;
    (status, Json(body))
}

pub async fn upload_chat_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(req): Json<UploadChatRequest>,
) -> impl IntoResponse {
    let (status, body) = upload_chat_inner(&state, header_str(&headers, header::AUTHORIZATION.as_str()), req).await;
    (status, Json(body))
}

pub async fn sessions_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Query(query): Query<SessionsQuery>,
) -> impl IntoResponse {
    let (status, body) = sessions_inner(&state, header_str(&headers, header::AUTHORIZATION.as_str()), query).await;
    (status, Json(body))
}

pub async fn session_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
) -> impl IntoResponse {
    let (status, body) = session_inner(&state, header_str(&headers, header::AUTHORIZATION.as_str()), query).await;
    (status, Json(body))
}

pub async fn feedback_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(req): Json<FeedbackRequest>,
) -> impl IntoResponse {
    let (status, body) = feedback_inner(&state, header_str(&headers, header::AUTHORIZATION.as_str()), req).await;
    (status, Json(body))
}

pub async fn title_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(req): Json<TitleRequest>,
) -> impl IntoResponse {
    let (status, body) = title_inner(&state, header_str(&headers, header::AUTHORIZATION.as_str()), req).await;
    (status, Json(body))
}

// ============================================================================
// Helpers
// ============================================================================

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn authenticate(state: &HttpState, authorization: Option<&str>) -> Result<String, (StatusCode, Value)> {
    state.auth.subject(authorization).map_err(|e| {
        tracing::debug!(error = %e, "Rejected request without a valid token");
        error_body(StatusCode::UNAUTHORIZED, "invalid or missing bearer token")
    })
}

fn error_body(status: StatusCode, msg: &str) -> (StatusCode, Value) {
    (status, json!({"error": msg, "status": "error"}))
}

/// Map a router response to an HTTP status and body.
pub fn response_to_http(response: LendResponse) -> (StatusCode, Value) {
    if response.is_ok() {
        return (StatusCode::OK, response.data.unwrap_or_else(|| json!({})));
    }
    let status = match response.code {
        Some(ErrorCode::BadRequest) => StatusCode::BAD_REQUEST,
        Some(ErrorCode::NotFound) => StatusCode::NOT_FOUND,
        Some(ErrorCode::Internal) | None => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let msg = response.error.unwrap_or_else(|| "unknown error".to_string());
    (status, json!({"error": msg, "status": "error"}))
}

// ============================================================================
// Unit Tests
// ============================================================================
