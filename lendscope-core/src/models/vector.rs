use serde::{Deserialize, Serialize};

/// A similarity match from the vector index.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VectorHit {
    pub document_id: String,
    /// 1 - cosine distance
    pub score: f64,
    pub metadata: serde_json::Value,
}

impl VectorHit {
    /// The offer description stored alongside the vector, if any.
    pub fn description(&self) -> Option<&str> {
        self.metadata.get("description").and_then(|v| v.as_str())
    }
}
