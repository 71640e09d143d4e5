use serde::{Deserialize, Serialize};

use crate::models::SessionKind;

/// Version string carried on every envelope.
pub const PROTOCOL_VERSION: &str = "lendscope/1";

/// Requests accepted by the server router, independent of transport.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LendRequest {
    Ping,
    Health,
    Chat {
        user_id: String,
        session_id: Option<String>,
        message: String,
    },
    Upload {
        user_id: String,
        session_id: Option<String>,
        filename: String,
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },
    UploadChat {
        user_id: String,
        session_id: String,
        message: String,
    },
    ListSessions {
        user_id: String,
        kind: Option<SessionKind>,
        limit: Option<usize>,
    },
    GetSession {
        user_id: String,
        session_id: String,
    },
    UpdateFeedback {
        user_id: String,
        session_id: String,
        message_index: usize,
        feedback: Option<String>,
        rating: Option<i32>,
    },
    UpdateTitle {
        user_id: String,
        session_id: String,
        title: String,
    },
}

/// Failure class of an error response, for transports that map it to a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    Internal,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LendResponse {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub version: String,
}

impl LendResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            code: None,
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self::err_with(ErrorCode::Internal, msg)
    }

    pub fn err_with(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            code: Some(code),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(serde_json::json!({"pong": true}))
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        STANDARD.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_tagged_by_action() {
        let req: LendRequest = serde_json::from_value(serde_json::json!({
            "action": "chat",
            "user_id": "u1",
            "session_id": null,
            "message": "bridge lenders in TX"
        }))
        .unwrap();
        assert!(matches!(req, LendRequest::Chat { ref message, .. } if message == "bridge lenders in TX"));
    }

    #[test]
    fn test_upload_content_is_base64() {
        let req = LendRequest::Upload {
            user_id: "u1".into(),
            session_id: None,
            filename: "terms.txt".into(),
            content: b"hello".to_vec(),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["content"], "aGVsbG8=");

        let back: LendRequest = serde_json::from_value(value).unwrap();
        assert!(matches!(back, LendRequest::Upload { content, .. } if content == b"hello"));
    }

    #[test]
    fn test_response_envelope() {
        let ok = LendResponse::ok(serde_json::json!({"n": 1}));
        assert!(ok.is_ok());
        assert_eq!(ok.version, PROTOCOL_VERSION);

        let err = LendResponse::err("nope");
        assert!(!err.is_ok());
        assert_eq!(err.error.as_deref(), Some("nope"));
        assert_eq!(err.code, Some(ErrorCode::Internal));
        assert!(err.data.is_none());

        let missing = LendResponse::err_with(ErrorCode::NotFound, "Session not found");
        let value = serde_json::to_value(&missing).unwrap();
        assert_eq!(value["code"], "not_found");
        assert!(serde_json::to_value(&ok).unwrap().get("code").is_none());
    }
}
