//! Upload and upload-chat flows.
//!
//! Upload: `received -> parsed -> relevance-checked -> extracted -> dedup-checked`,
//! ending in a staged extraction or a duplicate outcome. Nothing is
//! catalogued at upload time; a later upload-chat turn with consent persists
//! the offer, indexes it and binds it to the session. Consent re-runs the
//! duplicate check, since the catalogue may have changed since upload.

use std::sync::Arc;

use chrono::Utc;
use lendscope_core::completion::complete_structured;
use lendscope_core::models::session::recent_turns;
use lendscope_core::models::{clamp_title, Confidence, ConversationTurn, LoanOffer, OfferTerms, SessionKind};
use lendscope_core::{CompletionGateway, LendscopeError, OfferStore, StateStore, StructuredOutput};
use serde::Serialize;
use uuid::Uuid;

use crate::dedup::{check_catalogue_conflict, check_duplicate, DuplicateCheck};
use crate::error::IngestError;
use crate::extract::TextExtractor;
use crate::extraction::{conform, DocumentExtraction, UploadChatReply, EXTRACTION_PROMPT, UPLOAD_CHAT_PROMPT};
use crate::indexing::OfferIndexer;
use crate::relevance::{check_relevance, truncate_chars, Relevance, MAX_DOCUMENT_CHARS};

/// User turn recorded for an upload.
pub const UPLOAD_TURN: &str = "Uploaded document";
pub const EMPTY_DOCUMENT_MESSAGE: &str = "Failed to extract text from document";
pub const IRRELEVANT_MESSAGE: &str = "The document is not relevant";
pub const DUPLICATE_REDIRECT_MESSAGE: &str = "Similar document already exists.";
pub const DUPLICATE_REJECTED_MESSAGE: &str =
    "Similar document already exists. Contact admin for more information.";

/// Earlier upload-chat turns sent with each follow-up.
pub const DEFAULT_HISTORY_WINDOW: usize = 10;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UploadOutcome {
    EmptyDocument {
        session_id: String,
    },
    Irrelevant {
        session_id: String,
        confidence: Confidence,
    },
    /// `session_id` is the uploader's existing session on the offer.
    DuplicateRedirect {
        session_id: String,
        document_id: String,
        upload_session_id: String,
    },
    DuplicateRejected {
        session_id: String,
    },
    Extracted {
        session_id: String,
        document_id: String,
        extracted_info: OfferTerms,
        issues: Vec<String>,
        message: String,
    },
}

impl UploadOutcome {
    pub fn session_id(&self) -> &str {
        match self {
            UploadOutcome::EmptyDocument { session_id }
            | UploadOutcome::Irrelevant { session_id, .. }
            | UploadOutcome::DuplicateRedirect { session_id, .. }
            | UploadOutcome::DuplicateRejected { session_id }
            | UploadOutcome::Extracted { session_id, .. } => session_id,
        }
    }

    /// Text shown to the user.
    pub fn message(&self) -> &str {
        match self {
            UploadOutcome::EmptyDocument { .. } => EMPTY_DOCUMENT_MESSAGE,
            UploadOutcome::Irrelevant { .. } => IRRELEVANT_MESSAGE,
            UploadOutcome::DuplicateRedirect { .. } => DUPLICATE_REDIRECT_MESSAGE,
            UploadOutcome::DuplicateRejected { .. } => DUPLICATE_REJECTED_MESSAGE,
            UploadOutcome::Extracted { message, .. } => message,
        }
    }
}

/// Why a consented offer was not catalogued.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CatalogueConflict {
    /// The user already has a session on the catalogued offer.
    DuplicateRedirect { session_id: String, document_id: String },
    DuplicateRejected,
}

impl CatalogueConflict {
    pub fn message(&self) -> &'static str {
        match self {
            CatalogueConflict::DuplicateRedirect { .. } => DUPLICATE_REDIRECT_MESSAGE,
            CatalogueConflict::DuplicateRejected => DUPLICATE_REJECTED_MESSAGE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadChatOutcome {
    pub session_id: String,
    pub document_id: String,
    pub message: String,
    pub extracted_info: OfferTerms,
    pub issues: Vec<String>,
    /// The offer was written to the catalog this turn.
    pub stored: bool,
    /// A vector was written for the offer this turn.
    pub indexed: bool,
    pub is_updated: bool,
    /// Set when consent was given but the company is already catalogued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<CatalogueConflict>,
}

#[derive(Clone)]
pub struct UploadPipeline {
    gateway: Arc<dyn CompletionGateway>,
    extractor: Arc<dyn TextExtractor>,
    offers: Arc<dyn OfferStore>,
    state: StateStore,
    indexer: OfferIndexer,
    history_window: usize,
}

impl UploadPipeline {
    pub fn new(
        gateway: Arc<dyn CompletionGateway>,
        extractor: Arc<dyn TextExtractor>,
        offers: Arc<dyn OfferStore>,
        state: StateStore,
        indexer: OfferIndexer,
    ) -> Self {
        Self {
            gateway,
            extractor,
            offers,
            state,
            indexer,
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }

    pub fn with_history_window(mut self, turns: usize) -> Self {
        self.history_window = turns.max(1);
        self
    }

    pub async fn upload(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        filename: &str,
        bytes: &[u8],
    ) -> Result<UploadOutcome, IngestError> {
        let session_id = session_id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::info!(user_id = %user_id, session_id = %session_id, filename = %filename, "Upload received");

        let text = self.extractor.extract_text(bytes, filename).await?;
        if text.is_empty() {
            tracing::info!(session_id = %session_id, filename = %filename, "No text extracted");
            return Ok(UploadOutcome::EmptyDocument { session_id });
        }

        match check_relevance(self.gateway.as_ref(), &text).await {
            Relevance::Relevant(_) => {}
            Relevance::Irrelevant(confidence) => {
                tracing::info!(session_id = %session_id, confidence = confidence.as_str(), "Upload not relevant");
                return Ok(UploadOutcome::Irrelevant { session_id, confidence });
            }
            Relevance::Error(reason) => return Err(IngestError::Relevance(reason)),
        }

        let extraction = complete_structured::<DocumentExtraction>(
            self.gateway.as_ref(),
            EXTRACTION_PROMPT,
            &[ConversationTurn::user(truncate_chars(&text, MAX_DOCUMENT_CHARS))],
        )
        .await?;
        let schema = DocumentExtraction::output_schema().qualified_name();
        let (terms, issues) = conform(&extraction.extracted_info, &schema)?;

        let duplicate = check_duplicate(
            self.offers.as_ref(),
            self.state.sessions().as_ref(),
            user_id,
            &terms,
        )
        .await?;

        let session = self
            .state
            .open_session(Some(&session_id), user_id, SessionKind::Upload)
            .await?;
        let title = clamp_title(&extraction.chat_title);

        match duplicate {
            DuplicateCheck::Redirect {
                session_id: existing,
                document_id,
            } => {
                self.record_upload(&session.session_id, DUPLICATE_REDIRECT_MESSAGE, title.as_deref())
                    .await?;
                Ok(UploadOutcome::DuplicateRedirect {
                    session_id: existing,
                    document_id,
                    upload_session_id: session.session_id,
                })
            }
            DuplicateCheck::Rejected { .. } => {
                self.record_upload(&session.session_id, DUPLICATE_REJECTED_MESSAGE, title.as_deref())
                    .await?;
                Ok(UploadOutcome::DuplicateRejected {
                    session_id: session.session_id,
                })
            }
            DuplicateCheck::Unique => {
                let document_id = Uuid::new_v4().to_string();
                self.state
                    .stage_document(&session.session_id, &document_id, &terms)
                    .await?;
                self.record_upload(&session.session_id, &extraction.message, title.as_deref())
                    .await?;
                tracing::info!(
                    session_id = %session.session_id,
                    document_id = %document_id,
                    issues = issues.len(),
                    "Upload extracted, awaiting consent"
                );
                Ok(UploadOutcome::Extracted {
                    session_id: session.session_id,
                    document_id,
                    extracted_info: terms,
                    issues,
                    message: extraction.message,
                })
            }
        }
    }

    /// Follow-up turn on an upload session: merge corrections, and on consent
    /// catalogue and index the offer.
    pub async fn upload_chat(
        &self,
        user_id: &str,
        session_id: &str,
        message: &str,
    ) -> Result<UploadChatOutcome, IngestError> {
        let session = self
            .state
            .owned_session(session_id, user_id)
            .await?
            .ok_or_else(|| IngestError::SessionNotFound(session_id.to_string()))?;
        let sid = session.session_id.as_str();

        let pending = self
            .state
            .pending_offer(sid)
            .await?
            .ok_or_else(|| IngestError::NoPendingExtraction(sid.to_string()))?;
        let document_id = self
            .state
            .document_id(sid)
            .await?
            .ok_or_else(|| IngestError::NoPendingExtraction(sid.to_string()))?;

        let current = serde_json::to_string_pretty(&pending).map_err(LendscopeError::from)?;
        let system = format!("{}\n\nCURRENT EXTRACTION:\n{}", UPLOAD_CHAT_PROMPT, current);
        let conversation = self.state.conversation(sid).await?;
        let mut turns = recent_turns(&conversation, self.history_window).to_vec();
        turns.push(ConversationTurn::user(message));

        let reply = complete_structured::<UploadChatReply>(self.gateway.as_ref(), &system, &turns).await?;
        let schema = UploadChatReply::output_schema().qualified_name();
        let (terms, issues) = conform(&reply.extracted_info, &schema)?;

        let mut stored = false;
        let mut indexed = false;
        let mut duplicate = None;
        if reply.consent {
            match self.catalogue_check(user_id, &document_id, &terms).await? {
                (DuplicateCheck::Unique, existing) => {
                    let offer = self.persist_offer(user_id, &document_id, &terms, existing).await?;
                    stored = true;
                    indexed = match self.indexer.index_offer(&offer).await {
                        Ok(written) => written,
                        Err(e) => {
                            tracing::warn!(document_id = %document_id, error = %e, "Indexing failed, left for re-index");
                            false
                        }
                    };
                    self.state.bind_document(sid, &document_id).await?;
                }
                (
                    DuplicateCheck::Redirect {
                        session_id: existing_session,
                        document_id: existing_document,
                    },
                    _,
                ) => {
                    duplicate = Some(CatalogueConflict::DuplicateRedirect {
                        session_id: existing_session,
                        document_id: existing_document,
                    });
                }
                (DuplicateCheck::Rejected { .. }, _) => {
                    duplicate = Some(CatalogueConflict::DuplicateRejected);
                }
            }
        }
        let reply_text = match &duplicate {
            Some(conflict) => conflict.message().to_string(),
            None => reply.message,
        };

        self.state
            .append_turns(
                sid,
                &[ConversationTurn::user(message), ConversationTurn::assistant(reply_text.clone())],
                None,
            )
            .await?;
        self.state.save_pending_offer(sid, &terms).await?;

        tracing::info!(
            session_id = %sid,
            document_id = %document_id,
            consent = reply.consent,
            stored,
            indexed,
            duplicate = duplicate.is_some(),
            "Upload chat turn complete"
        );

        Ok(UploadChatOutcome {
            session_id: sid.to_string(),
            document_id,
            message: reply_text,
            extracted_info: terms,
            issues,
            stored,
            indexed,
            is_updated: reply.is_updated,
            duplicate,
        })
    }

    /// Duplicate check before cataloguing `document_id`. Skipped when the
    /// offer is already catalogued under the same company; the catalogued
    /// row, if any, is handed back for the insert-or-update step.
    async fn catalogue_check(
        &self,
        user_id: &str,
        document_id: &str,
        terms: &OfferTerms,
    ) -> Result<(DuplicateCheck, Option<LoanOffer>), IngestError> {
        let existing = self.offers.get(document_id).await?;
        let same_company = existing
            .as_ref()
            .is_some_and(|offer| offer.terms.company_key() == terms.company_key());
        if same_company {
            return Ok((DuplicateCheck::Unique, existing));
        }

        let check = check_catalogue_conflict(
            self.offers.as_ref(),
            self.state.sessions().as_ref(),
            user_id,
            terms,
            document_id,
        )
        .await?;
        if check != DuplicateCheck::Unique {
            tracing::info!(document_id = %document_id, "Consented offer duplicates a catalogued company, not stored");
        }
        Ok((check, existing))
    }

    /// Insert the offer, or update it when `document_id` is already catalogued.
    async fn persist_offer(
        &self,
        user_id: &str,
        document_id: &str,
        terms: &OfferTerms,
        existing: Option<LoanOffer>,
    ) -> Result<LoanOffer, IngestError> {
        match existing {
            Some(mut existing) => {
                self.offers.update(document_id, terms).await?;
                existing.terms = terms.clone();
                existing.updated_at = Utc::now();
                tracing::info!(document_id = %document_id, "Catalogued offer updated");
                Ok(existing)
            }
            None => {
                let offer = LoanOffer::new(document_id, terms.clone(), user_id);
                self.offers.insert(&offer).await?;
                tracing::info!(document_id = %document_id, "Offer catalogued");
                Ok(offer)
            }
        }
    }

    async fn record_upload(&self, session_id: &str, reply: &str, title: Option<&str>) -> Result<(), LendscopeError> {
        self.state
            .append_turns(
                session_id,
                &[ConversationTurn::user(UPLOAD_TURN), ConversationTurn::assistant(reply)],
                title,
            )
            .await
            .map(|_| ())
    }
}
