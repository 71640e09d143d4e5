//! HTTP API tests, dispatched through the axum router with `oneshot`.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{services, ScriptedGateway};
use lendscope_server::auth::Authenticator;
use lendscope_server::http::{build_router, health_inner, HttpState};
use serde_json::{json, Value};
use tower::ServiceExt;

const SECRET: &str = "http-test-secret";

fn state(gateway: ScriptedGateway) -> Arc<HttpState> {
    Arc::new(HttpState {
        services: services(gateway).services,
        auth: Authenticator::new(SECRET),
    })
}

fn bearer(user_id: &str) -> String {
    format!("Bearer {}", Authenticator::new(SECRET).issue(user_id, 15).unwrap())
}

async fn send(state: Arc<HttpState>, req: Request<Body>) -> (StatusCode, Value) {
    let resp = build_router(state).oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn post_json(uri: &str, auth: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_version_endpoint() {
    let req = Request::builder().uri("/version").body(Body::empty()).unwrap();
    let (status, body) = send(state(ScriptedGateway::default()), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["protocol"], "lendscope/1");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_health_without_database() {
    let s = state(ScriptedGateway::default());
    let (status, body) = health_inner(&s.services).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["storage"], "memory");
}

#[tokio::test]
async fn test_chat_requires_token() {
    let s = state(ScriptedGateway::default());
    let (status, body) = send(s.clone(), post_json("/chat", None, json!({"message": "hi"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], "error");

    let (status, _) = send(s, post_json("/chat", Some("Bearer not-a-jwt"), json!({"message": "hi"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_chat_turn_over_http() {
    let s = state(
        ScriptedGateway::default()
            .reply("intent", json!({"intent": "general_lending", "confidence": "medium", "reason": "x"}))
            .reply("chat_response", json!({"response": "A bridge loan is short-term financing.", "chat_title": "Bridge Loans"})),
    );
    let auth = bearer("u-http");

    let (status, body) = send(
        s.clone(),
        post_json("/chat", Some(&auth), json!({"message": "what is a bridge loan?"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{:?}", body);
    assert_eq!(body["intent"], "general_lending");
    assert_eq!(body["response"], "A bridge loan is short-term financing.");
    assert!(body["took_ms"].is_number());
    let sid = body["session_id"].as_str().unwrap().to_string();

    let req = Request::builder()
        .uri("/sessions?limit=5")
        .header("authorization", &auth)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(s.clone(), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"][0]["session_id"], sid.as_str());
    assert_eq!(body["sessions"][0]["title"], "Bridge Loans");

    let req = Request::builder()
        .uri(format!("/session?session_id={}", sid))
        .header("authorization", bearer("someone-else"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(s, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_chat_rejects_blank_message() {
    let s = state(ScriptedGateway::default());
    let (status, body) = send(s, post_json("/chat", Some(&bearer("u1")), json!({"message": "   "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "message field is required");
}

#[tokio::test]
async fn test_upload_requires_filename_and_rejects_unknown_session() {
    let s = state(ScriptedGateway::default());
    let auth = bearer("u1");

    let req = Request::builder()
        .method("POST")
        .uri("/upload")
        .header("authorization", &auth)
        .body(Body::from("terms"))
        .unwrap();
    let (status, _) = send(s.clone(), req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        s,
        post_json("/upload_chat", Some(&auth), json!({"session_id": "missing", "message": "yes"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_empty_upload_reports_empty_document() {
    let s = state(ScriptedGateway::default());
    let req = Request::builder()
        .method("POST")
        .uri("/upload")
        .header("authorization", bearer("u1"))
        .header("x-filename", "blank.txt")
        .body(Body::from("   "))
        .unwrap();
    let (status, body) = send(s, req).await;
    assert_eq!(status, StatusCode::OK, "{:?}", body);
    assert_eq!(body["outcome"], "empty_document");
    assert_eq!(body["message"], "Failed to extract text from document");
}

#[tokio::test]
async fn test_update_title_requires_title() {
    let s = state(ScriptedGateway::default());
    let (status, _) = send(
        s,
        post_json(
            "/update_session_title",
            Some(&bearer("u1")),
            json!({"session_id": "s1", "title": " "}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
