//! Postgres-backed stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{OfferStore, SessionStore, VectorIndex};
use crate::error::LendscopeError;
use crate::models::{ConversationTurn, LoanOffer, OfferTerms, Session, SessionSummary, VectorHit};
use crate::predicate::StorePredicate;

// ============================================================================
// Sessions
// ============================================================================

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    session_id: String,
    user_id: String,
    kind: String,
    messages: Json<Vec<ConversationTurn>>,
    document_id: Option<String>,
    document_snapshot: Option<Json<OfferTerms>>,
    title: String,
    created_at: DateTime<Utc>,
    last_interaction_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for Session {
    type Error = LendscopeError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Session {
            id: row.id,
            session_id: row.session_id,
            user_id: row.user_id,
            kind: row.kind.parse().map_err(LendscopeError::Other)?,
            messages: row.messages.0,
            document_id: row.document_id,
            document_snapshot: row.document_snapshot.map(|j| j.0),
            title: row.title,
            created_at: row.created_at,
            last_interaction_at: row.last_interaction_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    session_id: String,
    kind: String,
    title: String,
    document_id: Option<String>,
    created_at: DateTime<Utc>,
    last_interaction_at: DateTime<Utc>,
}

const SESSION_COLUMNS: &str = "id, session_id, user_id, kind, messages, document_id, \
     document_snapshot, title, created_at, last_interaction_at";

pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, session: &Session) -> Result<(), LendscopeError> {
        sqlx::query(
            r#"
            INSERT INTO chat_sessions
                (id, session_id, user_id, kind, messages, document_id, document_snapshot,
                 title, created_at, last_interaction_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(session.id)
        .bind(&session.session_id)
        .bind(&session.user_id)
        .bind(session.kind.as_str())
        .bind(Json(&session.messages))
        .bind(&session.document_id)
        .bind(session.document_snapshot.as_ref().map(Json))
        .bind(&session.title)
        .bind(session.created_at)
        .bind(session.last_interaction_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>, LendscopeError> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM chat_sessions WHERE session_id = $1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Session::try_from).transpose()
    }

    async fn list_for_user(&self, user_id: &str, limit: usize) -> Result<Vec<SessionSummary>, LendscopeError> {
        let rows: Vec<SummaryRow> = sqlx::query_as(
            r#"
            SELECT session_id, kind, title, document_id, created_at, last_interaction_at
            FROM chat_sessions
            WHERE user_id = $1
            ORDER BY last_interaction_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(SessionSummary {
                    session_id: r.session_id,
                    kind: r.kind.parse().map_err(LendscopeError::Other)?,
                    title: r.title,
                    document_id: r.document_id,
                    created_at: r.created_at,
                    last_interaction_at: r.last_interaction_at,
                })
            })
            .collect()
    }

    async fn append_turns(
        &self,
        session_id: &str,
        turns: &[ConversationTurn],
        title: Option<&str>,
    ) -> Result<usize, LendscopeError> {
        // GREATEST keeps the timestamp strictly increasing even if the clock stalls.
        let count: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE chat_sessions
            SET messages = messages || $2::jsonb,
                last_interaction_at = GREATEST(clock_timestamp(), last_interaction_at + interval '1 microsecond'),
                title = COALESCE(NULLIF(btrim($3::text), ''), title)
            WHERE session_id = $1
            RETURNING jsonb_array_length(messages)
            "#,
        )
        .bind(session_id)
        .bind(Json(turns))
        .bind(title)
        .fetch_optional(&self.pool)
        .await?;

        count
            .map(|(n,)| n.max(0) as usize)
            .ok_or_else(|| LendscopeError::NotFound(format!("session {}", session_id)))
    }

    async fn set_document(
        &self,
        session_id: &str,
        document_id: Option<&str>,
        snapshot: Option<&OfferTerms>,
    ) -> Result<(), LendscopeError> {
        let result = sqlx::query(
            r#"
            UPDATE chat_sessions
            SET document_id = COALESCE($2, document_id),
                document_snapshot = COALESCE($3, document_snapshot)
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(document_id)
        .bind(snapshot.map(Json))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LendscopeError::NotFound(format!("session {}", session_id)));
        }
        Ok(())
    }

    async fn set_feedback(
        &self,
        session_id: &str,
        index: usize,
        feedback: Option<&str>,
        rating: Option<i32>,
    ) -> Result<bool, LendscopeError> {
        let Ok(index) = i32::try_from(index) else {
            return Ok(false);
        };
        let result = sqlx::query(
            r#"
            UPDATE chat_sessions
            SET messages = jsonb_set(
                    jsonb_set(messages, ARRAY[$2::int::text, 'feedback'], COALESCE(to_jsonb($3::text), 'null'::jsonb)),
                    ARRAY[$2::int::text, 'rating'], COALESCE(to_jsonb($4::int), 'null'::jsonb))
            WHERE session_id = $1 AND jsonb_array_length(messages) > $2::int
            "#,
        )
        .bind(session_id)
        .bind(index)
        .bind(feedback)
        .bind(rating)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_title(&self, session_id: &str, title: &str) -> Result<bool, LendscopeError> {
        let result = sqlx::query("UPDATE chat_sessions SET title = $2 WHERE session_id = $1")
            .bind(session_id)
            .bind(title)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_for_documents(
        &self,
        user_id: &str,
        document_ids: &[String],
    ) -> Result<Option<Session>, LendscopeError> {
        if document_ids.is_empty() {
            return Ok(None);
        }
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM chat_sessions \
             WHERE user_id = $1 AND document_id = ANY($2) \
             ORDER BY last_interaction_at DESC LIMIT 1",
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .bind(document_ids)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Session::try_from).transpose()
    }
}

// ============================================================================
// Offers
// ============================================================================

#[derive(sqlx::FromRow)]
struct OfferRow {
    document_id: String,
    terms: Json<OfferTerms>,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<OfferRow> for LoanOffer {
    fn from(row: OfferRow) -> Self {
        LoanOffer {
            document_id: row.document_id,
            terms: row.terms.0,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const OFFER_COLUMNS: &str = "document_id, terms, created_by, created_at, updated_at";

pub struct PgOfferStore {
    pool: PgPool,
}

impl PgOfferStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Offers with no vector in `namespace`, oldest first.
    pub async fn missing_vectors(&self, namespace: &str, limit: usize) -> Result<Vec<LoanOffer>, LendscopeError> {
        let rows: Vec<OfferRow> = sqlx::query_as(
            r#"
            SELECT o.document_id, o.terms, o.created_by, o.created_at, o.updated_at
            FROM loan_offers o
            LEFT JOIN offer_vectors v
                ON v.document_id = o.document_id AND v.namespace = $1
            WHERE v.document_id IS NULL
            ORDER BY o.created_at
            LIMIT $2
            "#,
        )
        .bind(namespace)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(LoanOffer::from).collect())
    }
}

#[async_trait]
impl OfferStore for PgOfferStore {
    async fn get(&self, document_id: &str) -> Result<Option<LoanOffer>, LendscopeError> {
        let row: Option<OfferRow> = sqlx::query_as(&format!(
            "SELECT {} FROM loan_offers WHERE document_id = $1",
            OFFER_COLUMNS
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(LoanOffer::from))
    }

    async fn insert(&self, offer: &LoanOffer) -> Result<(), LendscopeError> {
        sqlx::query(
            r#"
            INSERT INTO loan_offers
                (document_id, company_name, company_key, terms, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&offer.document_id)
        .bind(&offer.terms.company_name)
        .bind(offer.terms.company_key())
        .bind(Json(&offer.terms))
        .bind(&offer.created_by)
        .bind(offer.created_at)
        .bind(offer.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, document_id: &str, terms: &OfferTerms) -> Result<bool, LendscopeError> {
        let result = sqlx::query(
            r#"
            UPDATE loan_offers
            SET terms = terms || $2::jsonb,
                company_name = COALESCE($3, company_name),
                company_key = COALESCE($4, company_key),
                updated_at = now()
            WHERE document_id = $1
            "#,
        )
        .bind(document_id)
        .bind(Json(terms))
        .bind(&terms.company_name)
        .bind(terms.company_key())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn search(&self, predicate: &StorePredicate, limit: usize) -> Result<Vec<LoanOffer>, LendscopeError> {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM loan_offers", OFFER_COLUMNS));
        predicate.push_where(&mut qb);
        qb.push(" ORDER BY created_at LIMIT ");
        qb.push_bind(limit as i64);

        let rows: Vec<OfferRow> = qb.build_query_as::<OfferRow>().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(LoanOffer::from).collect())
    }

    async fn find_by_company(&self, company_key: &str) -> Result<Vec<LoanOffer>, LendscopeError> {
        let rows: Vec<OfferRow> = sqlx::query_as(&format!(
            "SELECT {} FROM loan_offers WHERE company_key = $1 ORDER BY created_at",
            OFFER_COLUMNS
        ))
        .bind(company_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(LoanOffer::from).collect())
    }
}

// ============================================================================
// Vector index
// ============================================================================

/// pgvector-backed index, one row per `(namespace, document_id)`.
pub struct PgVectorIndex {
    pool: PgPool,
    namespace: String,
}

impl PgVectorIndex {
    pub fn new(pool: PgPool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn upsert(&self, document_id: &str, vector: Vec<f32>, metadata: Value) -> Result<(), LendscopeError> {
        sqlx::query(
            r#"
            INSERT INTO offer_vectors (namespace, document_id, embedding, metadata, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (namespace, document_id) DO UPDATE
                SET embedding = EXCLUDED.embedding,
                    metadata = EXCLUDED.metadata,
                    updated_at = now()
            "#,
        )
        .bind(&self.namespace)
        .bind(document_id)
        .bind(Vector::from(vector))
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query(&self, vector: Vec<f32>, top_k: usize) -> Result<Vec<VectorHit>, LendscopeError> {
        let hits: Vec<VectorHit> = sqlx::query_as(
            r#"
            SELECT document_id,
                   (1 - (embedding <=> $2::vector))::float8 AS score,
                   metadata
            FROM offer_vectors
            WHERE namespace = $1
            ORDER BY embedding <=> $2::vector
            LIMIT $3
            "#,
        )
        .bind(&self.namespace)
        .bind(Vector::from(vector))
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(hits)
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}

// ============================================================================
// TESTS (require Postgres; skipped when unavailable)
// ============================================================================
