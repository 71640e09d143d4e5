//! Transport-independent request dispatch.
//!
//! Every action resolves to a `LendResponse`. Internal failures are logged
//! here with full detail and reach the caller only as a generic message.

use lendscope_core::api::{ErrorCode, LendRequest, LendResponse};
use lendscope_core::models::SessionKind;
use lendscope_core::LendscopeError;
use lendscope_ingest::IngestError;
use serde_json::json;

use crate::services::Services;

const INTERNAL_MESSAGE: &str = "The request could not be completed. Please try again.";

/// Sessions scanned when listing is narrowed to one kind.
const KIND_SCAN_LIMIT: usize = 100;

pub async fn handle_request(request: LendRequest, services: &Services) -> LendResponse {
    match request {
        LendRequest::Ping => LendResponse::pong(),
        LendRequest::Health => health(services).await,
        LendRequest::Chat {
            user_id,
            session_id,
            message,
        } => {
            if message.trim().is_empty() {
                return LendResponse::err_with(ErrorCode::BadRequest, "message is required");
            }
            let _turn = match session_id.as_deref() {
                Some(sid) => Some(services.locks.acquire(sid).await),
                None => None,
            };
            let result = services.chat.run_turn(&user_id, session_id.as_deref(), message.trim()).await;
            drop(_turn);
            services.locks.prune();
            match result {
                Ok(outcome) => to_data(&outcome),
                Err(e) => store_error("chat", e),
            }
        }
        LendRequest::Upload {
            user_id,
            session_id,
            filename,
            content,
        } => {
            if filename.trim().is_empty() {
                return LendResponse::err_with(ErrorCode::BadRequest, "filename is required");
            }
            let _turn = match session_id.as_deref() {
                Some(sid) => Some(services.locks.acquire(sid).await),
                None => None,
            };
            let result = services
                .uploads
                .upload(&user_id, session_id.as_deref(), &filename, &content)
                .await;
            drop(_turn);
            services.locks.prune();
            match result {
                Ok(outcome) => {
                    let mut resp = to_data(&outcome);
                    if let Some(obj) = resp.data.as_mut().and_then(|d| d.as_object_mut()) {
                        obj.entry("message").or_insert_with(|| json!(outcome.message()));
                    }
                    resp
                }
                Err(e) => ingest_error("upload", e),
            }
        }
        LendRequest::UploadChat {
            user_id,
            session_id,
            message,
        } => {
            if message.trim().is_empty() {
                return LendResponse::err_with(ErrorCode::BadRequest, "message is required");
            }
            let turn = services.locks.acquire(&session_id).await;
            let result = services.uploads.upload_chat(&user_id, &session_id, message.trim()).await;
            drop(turn);
            services.locks.prune();
            match result {
                Ok(outcome) => to_data(&outcome),
                Err(e) => ingest_error("upload_chat", e),
            }
        }
        LendRequest::ListSessions { user_id, kind, limit } => {
            list_sessions(services, &user_id, kind, limit).await
        }
        LendRequest::GetSession { user_id, session_id } => {
            match services.state.owned_session(&session_id, &user_id).await {
                Ok(Some(session)) => {
                    services.state.warm(&session).await;
                    to_data(&session)
                }
                Ok(None) => session_not_found(&session_id),
                Err(e) => store_error("get_session", e),
            }
        }
        LendRequest::UpdateFeedback {
            user_id,
            session_id,
            message_index,
            feedback,
            rating,
        } => {
            if let Err(resp) = require_owned(services, &user_id, &session_id).await {
                return resp;
            }
            match services
                .state
                .set_feedback(&session_id, message_index, feedback.as_deref(), rating)
                .await
            {
                Ok(true) => LendResponse::ok(json!({"updated": true, "message_index": message_index})),
                Ok(false) => LendResponse::err_with(
                    ErrorCode::NotFound,
                    format!("message {} not found in session", message_index),
                ),
                Err(e) => store_error("update_feedback", e),
            }
        }
        LendRequest::UpdateTitle {
            user_id,
            session_id,
            title,
        } => {
            let title = title.trim();
            if title.is_empty() {
                return LendResponse::err_with(ErrorCode::BadRequest, "title is required");
            }
            if let Err(resp) = require_owned(services, &user_id, &session_id).await {
                return resp;
            }
            match services.state.rename(&session_id, title).await {
                Ok(true) => LendResponse::ok(json!({"updated": true, "title": title})),
                Ok(false) => session_not_found(&session_id),
                Err(e) => store_error("update_title", e),
            }
        }
    }
}

async fn health(services: &Services) -> LendResponse {
    let Some(pool) = &services.pool else {
        return LendResponse::ok(json!({
            "status": "healthy",
            "storage": "memory",
            "embeddings": services.embeddings.name(),
        }));
    };
    let pg_ver = match lendscope_core::db::health_check(pool).await {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "Database health check failed");
            return LendResponse::err("database unavailable");
        }
    };
    let vec_ver = match lendscope_core::db::check_pgvector(pool).await {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "pgvector check failed");
            return LendResponse::err("pgvector unavailable");
        }
    };
    LendResponse::ok(json!({
        "status": "healthy",
        "storage": "postgres",
        "postgresql": pg_ver,
        "pgvector": vec_ver,
        "embeddings": services.embeddings.name(),
        "namespace": services.index.namespace(),
    }))
}

async fn list_sessions(
    services: &Services,
    user_id: &str,
    kind: Option<SessionKind>,
    limit: Option<usize>,
) -> LendResponse {
    let limit = limit
        .filter(|l| *l > 0)
        .unwrap_or(services.config.retrieval.session_list_limit);
    let scan = if kind.is_some() { KIND_SCAN_LIMIT.max(limit) } else { limit };

    match services.state.list_sessions(user_id, scan).await {
        Ok(summaries) => {
            let sessions: Vec<_> = summaries
                .into_iter()
                .filter(|s| kind.map_or(true, |k| s.kind == k))
                .take(limit)
                .collect();
            LendResponse::ok(json!({"count": sessions.len(), "sessions": sessions}))
        }
        Err(e) => store_error("list_sessions", e),
    }
}

async fn require_owned(services: &Services, user_id: &str, session_id: &str) -> Result<(), LendResponse> {
    match services.state.owned_session(session_id, user_id).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(session_not_found(session_id)),
        Err(e) => Err(store_error("session_lookup", e)),
    }
}

fn to_data<T: serde::Serialize>(value: &T) -> LendResponse {
    match serde_json::to_value(value) {
        Ok(data) => LendResponse::ok(data),
        Err(e) => {
            tracing::error!(error = %e, "Response not serializable");
            LendResponse::err(INTERNAL_MESSAGE)
        }
    }
}

fn session_not_found(session_id: &str) -> LendResponse {
    LendResponse::err_with(ErrorCode::NotFound, format!("session {} not found", session_id))
}

fn store_error(action: &'static str, e: LendscopeError) -> LendResponse {
    match e {
        LendscopeError::NotFound(what) => LendResponse::err_with(ErrorCode::NotFound, format!("{} not found", what)),
        other => {
            tracing::error!(action, error = %other, "Request failed");
            LendResponse::err(INTERNAL_MESSAGE)
        }
    }
}

fn ingest_error(action: &'static str, e: IngestError) -> LendResponse {
    match e {
        IngestError::SessionNotFound(sid) => session_not_found(&sid),
        IngestError::Store(store) => store_error(action, store),
        e if e.is_client_error() => {
            tracing::info!(action, error = %e, "Request rejected");
            LendResponse::err_with(ErrorCode::BadRequest, e.to_string())
        }
        e => {
            tracing::error!(action, error = %e, "Request failed");
            LendResponse::err(INTERNAL_MESSAGE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lendscope_ingest::ExtractError;

    #[test]
    fn test_ingest_errors_map_to_codes() {
        let resp = ingest_error("t", IngestError::SessionNotFound("s1".into()));
        assert_eq!(resp.code, Some(ErrorCode::NotFound));

        let resp = ingest_error("t", IngestError::Extract(ExtractError::Unsupported("a.exe".into())));
        assert_eq!(resp.code, Some(ErrorCode::BadRequest));
        assert!(resp.error.unwrap().contains("a.exe"));

        let resp = ingest_error("t", IngestError::Relevance("upstream down".into()));
        assert_eq!(resp.code, Some(ErrorCode::Internal));
        assert_eq!(resp.error.as_deref(), Some(INTERNAL_MESSAGE));
    }

    #[test]
    fn test_store_errors_hide_detail() {
        let resp = store_error("t", LendscopeError::Other("password=hunter2".into()));
        assert_eq!(resp.code, Some(ErrorCode::Internal));
        assert!(!resp.error.unwrap().contains("hunter2"));

        let resp = store_error("t", LendscopeError::NotFound("session s9".into()));
        assert_eq!(resp.code, Some(ErrorCode::NotFound));
    }
}
