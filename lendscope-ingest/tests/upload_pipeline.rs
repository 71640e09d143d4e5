use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lendscope_core::models::{ConversationTurn, LoanOffer, OfferTerms, Session, SessionKind};
use lendscope_core::store::{MemoryOfferStore, MemorySessionStore, MemoryVectorIndex};
use lendscope_core::{
    CompletionError, CompletionGateway, EmbeddingBackend, EmbeddingError, MemoryCache, OfferStore,
    OutputSchema, SessionStore, StateStore,
};
use lendscope_ingest::{
    CatalogueConflict, ExtractError, IngestError, OfferIndexer, TextExtractor, UploadOutcome, UploadPipeline,
};
use serde_json::{json, Value};

/// Replies to structured calls from a per-schema queue.
#[derive(Default)]
struct ScriptedGateway {
    replies: Mutex<HashMap<String, VecDeque<Value>>>,
    calls: Mutex<Vec<String>>,
    /// Turn count and final turn of each structured call, by schema.
    sent: Mutex<Vec<(String, usize, String)>>,
}

impl ScriptedGateway {
    fn reply(self, schema: &str, value: Value) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(schema.to_string())
            .or_default()
            .push_back(value);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn sent(&self, schema: &str) -> Vec<(usize, String)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _, _)| name == schema)
            .map(|(_, count, last)| (*count, last.clone()))
            .collect()
    }
}

#[async_trait]
impl CompletionGateway for ScriptedGateway {
    async fn complete(&self, _system: &str, _turns: &[ConversationTurn]) -> Result<String, CompletionError> {
        Err(CompletionError::EmptyResponse)
    }

    async fn complete_structured_raw(
        &self,
        _system: &str,
        turns: &[ConversationTurn],
        schema: &OutputSchema,
    ) -> Result<Value, CompletionError> {
        self.calls.lock().unwrap().push(schema.name.clone());
        let last = turns.last().map(|t| t.content.clone()).unwrap_or_default();
        self.sent.lock().unwrap().push((schema.name.clone(), turns.len(), last));
        self.replies
            .lock()
            .unwrap()
            .get_mut(&schema.name)
            .and_then(VecDeque::pop_front)
            .ok_or(CompletionError::Timeout)
    }

    async fn vision_extract_text(&self, _image: &[u8], _mime: &str) -> Result<String, CompletionError> {
        Err(CompletionError::EmptyResponse)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Treats every upload as plain text.
struct PlainText;

#[async_trait]
impl TextExtractor for PlainText {
    async fn extract_text(&self, bytes: &[u8], _filename: &str) -> Result<String, ExtractError> {
        String::from_utf8(bytes.to_vec())
            .map(|s| s.trim().to_string())
            .map_err(|_| ExtractError::Encoding)
    }
}

struct UnitEmbedding;

#[async_trait]
impl EmbeddingBackend for UnitEmbedding {
    async fn embed(&self, _text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        Ok(Some(vec![1.0, 0.0, 0.0]))
    }
    fn dimensions(&self) -> usize {
        3
    }
    fn name(&self) -> &str {
        "unit"
    }
}

struct Harness {
    pipeline: UploadPipeline,
    gateway: Arc<ScriptedGateway>,
    offers: Arc<MemoryOfferStore>,
    sessions: Arc<MemorySessionStore>,
    index: Arc<MemoryVectorIndex>,
}

fn harness(gateway: ScriptedGateway) -> Harness {
    let gateway = Arc::new(gateway);
    let offers = Arc::new(MemoryOfferStore::new());
    let sessions = Arc::new(MemorySessionStore::new());
    let index = Arc::new(MemoryVectorIndex::new("test"));
    let state = StateStore::new(sessions.clone(), Arc::new(MemoryCache::new()), Duration::from_secs(3600));
    let pipeline = UploadPipeline::new(
        gateway.clone(),
        Arc::new(PlainText),
        offers.clone(),
        state,
        OfferIndexer::new(Arc::new(UnitEmbedding), index.clone()),
    );
    Harness {
        pipeline,
        gateway,
        offers,
        sessions,
        index,
    }
}

fn relevant() -> Value {
    json!({"document_type": "relevant_document", "confidence": "high"})
}

fn extraction(company: &str) -> Value {
    json!({
        "extracted_info": {
            "company_name": company,
            "service_areas": ["CA", "NV"],
            "loan_amount": {"min": "250k", "max": "2M"},
            "dscr": "MISSING"
        },
        "message": "DSCR is missing. Shall I add these terms to the catalog?",
        "chat_title": "Acme Bridge Program Terms"
    })
}

const RATE_SHEET: &[u8] = b"Acme Lending bridge loans, 250k to 2M, CA and NV.";

#[tokio::test]
async fn test_unique_upload_is_staged_not_catalogued() {
    let h = harness(
        ScriptedGateway::default()
            .reply("relevance_check", relevant())
            .reply("document_extraction", extraction("Acme Lending")),
    );

    let outcome = h.pipeline.upload("u1", Some("s1"), "sheet.txt", RATE_SHEET).await.unwrap();
    let UploadOutcome::Extracted {
        session_id,
        document_id,
        extracted_info,
        ..
    } = outcome
    else {
        panic!("expected extraction, got {:?}", outcome);
    };
    assert_eq!(session_id, "s1");
    assert_eq!(extracted_info.loan_amount.max, Some(2_000_000.0));
    assert!(h.offers.is_empty());

    let session = h.sessions.get("s1").await.unwrap().unwrap();
    assert_eq!(session.kind, SessionKind::Upload);
    assert_eq!(session.document_id.as_deref(), Some(document_id.as_str()));
    assert!(session.document_snapshot.is_some());
    assert_eq!(session.title, "Acme Bridge Program");
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].content, "Uploaded document");
}

#[tokio::test]
async fn test_empty_and_irrelevant_uploads_stop_early() {
    let h = harness(ScriptedGateway::default().reply(
        "relevance_check",
        json!({"document_type": "irrelevant_document", "confidence": "medium"}),
    ));

    let empty = h.pipeline.upload("u1", Some("s1"), "blank.txt", b"   ").await.unwrap();
    assert!(matches!(empty, UploadOutcome::EmptyDocument { .. }));
    assert_eq!(empty.message(), "Failed to extract text from document");

    let irrelevant = h.pipeline.upload("u1", Some("s1"), "menu.txt", b"Soup of the day").await.unwrap();
    assert!(matches!(irrelevant, UploadOutcome::Irrelevant { .. }));
    assert_eq!(irrelevant.session_id(), "s1");

    assert_eq!(h.gateway.calls(), vec!["relevance_check"]);
    assert!(h.sessions.get("s1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_relevance_failure_fails_the_upload() {
    let h = harness(ScriptedGateway::default());
    let err = h.pipeline.upload("u1", None, "sheet.txt", RATE_SHEET).await.unwrap_err();
    assert!(matches!(err, IngestError::Relevance(_)));
    assert!(!err.is_client_error());
}

#[tokio::test]
async fn test_duplicate_without_owned_session_is_rejected() {
    let h = harness(
        ScriptedGateway::default()
            .reply("relevance_check", relevant())
            .reply("document_extraction", extraction("ACME Lending LLC")),
    );
    let existing = OfferTerms {
        company_name: Some("Acme Lending".into()),
        ..Default::default()
    };
    h.offers.insert(&LoanOffer::new("doc-1", existing, "u1")).await.unwrap();

    let outcome = h.pipeline.upload("u2", Some("s2"), "sheet.txt", RATE_SHEET).await.unwrap();
    assert!(matches!(outcome, UploadOutcome::DuplicateRejected { .. }));
    assert_eq!(
        outcome.message(),
        "Similar document already exists. Contact admin for more information."
    );
    assert_eq!(h.offers.len(), 1);
    assert!(!h.index.contains("doc-1"));

    // The upload session records the exchange but stages nothing.
    let session = h.sessions.get("s2").await.unwrap().unwrap();
    assert!(session.document_id.is_none());
    assert!(session.document_snapshot.is_none());
    assert_eq!(session.messages.len(), 2);
}

#[tokio::test]
async fn test_duplicate_with_owned_session_redirects() {
    let h = harness(
        ScriptedGateway::default()
            .reply("relevance_check", relevant())
            .reply("document_extraction", extraction("Acme Lending")),
    );
    h.offers
        .insert(&LoanOffer::new(
            "doc-1",
            OfferTerms {
                company_name: Some("Acme Lending".into()),
                ..Default::default()
            },
            "u1",
        ))
        .await
        .unwrap();
    let mut owned = Session::new("s-old", "u1", SessionKind::Upload);
    owned.document_id = Some("doc-1".into());
    h.sessions.create(&owned).await.unwrap();

    let outcome = h.pipeline.upload("u1", None, "sheet.txt", RATE_SHEET).await.unwrap();
    match outcome {
        UploadOutcome::DuplicateRedirect {
            session_id,
            document_id,
            upload_session_id,
        } => {
            assert_eq!(session_id, "s-old");
            assert_eq!(document_id, "doc-1");
            assert_ne!(upload_session_id, "s-old");
        }
        other => panic!("expected redirect, got {:?}", other),
    }
    assert_eq!(h.offers.len(), 1);
}

#[tokio::test]
async fn test_consent_inserts_then_updates() {
    let h = harness(
        ScriptedGateway::default()
            .reply("relevance_check", relevant())
            .reply("document_extraction", extraction("Acme Lending"))
            .reply(
                "upload_chat",
                json!({
                    "extracted_info": {"company_name": "Acme Lending", "dscr": {"min": 1.2, "max": 1.2}},
                    "message": "Added DSCR. Save to the catalog?",
                    "consent": false,
                    "is_updated": true
                }),
            )
            .reply(
                "upload_chat",
                json!({
                    "extracted_info": {"company_name": "Acme Lending", "dscr": {"min": 1.2, "max": 1.2}},
                    "message": "Thanks, the catalog is updated.",
                    "consent": true,
                    "is_updated": false
                }),
            )
            .reply(
                "upload_chat",
                json!({
                    "extracted_info": {"company_name": "Acme Lending", "dscr": {"min": 1.25, "max": 1.25}},
                    "message": "Updated DSCR in the catalog.",
                    "consent": true,
                    "is_updated": true
                }),
            ),
    );

    let outcome = h.pipeline.upload("u1", Some("s1"), "sheet.txt", RATE_SHEET).await.unwrap();
    let UploadOutcome::Extracted { document_id, .. } = outcome else {
        panic!("expected extraction");
    };

    let first = h.pipeline.upload_chat("u1", "s1", "DSCR is 1.2x").await.unwrap();
    assert!(first.is_updated);
    assert!(!first.stored);
    assert!(h.offers.is_empty());

    let second = h.pipeline.upload_chat("u1", "s1", "Yes, save it").await.unwrap();
    assert!(second.stored);
    assert!(second.indexed);
    assert_eq!(second.document_id, document_id);
    assert_eq!(h.offers.len(), 1);
    assert!(h.index.contains(&document_id));

    let third = h.pipeline.upload_chat("u1", "s1", "Actually DSCR is 1.25, update it").await.unwrap();
    assert!(third.stored);
    assert_eq!(h.offers.len(), 1);
    let stored = h.offers.get(&document_id).await.unwrap().unwrap();
    assert_eq!(stored.terms.dscr.min, Some(1.25));
    assert_eq!(stored.created_by, "u1");

    let session = h.sessions.get("s1").await.unwrap().unwrap();
    assert_eq!(session.messages.len(), 8);
    assert_eq!(session.document_snapshot.and_then(|t| t.dscr.max), Some(1.25));
}

#[tokio::test]
async fn test_upload_chat_requires_owned_session_with_extraction() {
    let h = harness(ScriptedGateway::default());
    h.sessions.create(&Session::new("s1", "u1", SessionKind::Upload)).await.unwrap();

    let missing = h.pipeline.upload_chat("u1", "nope", "hi").await.unwrap_err();
    assert!(matches!(missing, IngestError::SessionNotFound(_)));

    let foreign = h.pipeline.upload_chat("u2", "s1", "hi").await.unwrap_err();
    assert!(matches!(foreign, IngestError::SessionNotFound(_)));

    let nothing_pending = h.pipeline.upload_chat("u1", "s1", "hi").await.unwrap_err();
    assert!(matches!(nothing_pending, IngestError::NoPendingExtraction(_)));
    assert!(nothing_pending.is_client_error());
}

fn consent(company: &str) -> Value {
    json!({
        "extracted_info": {"company_name": company, "service_areas": ["CA"]},
        "message": "Saved to the catalog.",
        "consent": true,
        "is_updated": false
    })
}

fn staged_document(outcome: UploadOutcome) -> String {
    match outcome {
        UploadOutcome::Extracted { document_id, .. } => document_id,
        other => panic!("expected extraction, got {:?}", other),
    }
}

#[tokio::test]
async fn test_same_company_staged_twice_is_catalogued_once() {
    let h = harness(
        ScriptedGateway::default()
            .reply("relevance_check", relevant())
            .reply("relevance_check", relevant())
            .reply("document_extraction", extraction("Acme Lending"))
            .reply("document_extraction", extraction("Acme Lending"))
            .reply("upload_chat", consent("Acme Lending"))
            .reply("upload_chat", consent("Acme Lending")),
    );

    let first_doc = staged_document(h.pipeline.upload("u1", Some("s1"), "a.txt", RATE_SHEET).await.unwrap());
    let second_doc = staged_document(h.pipeline.upload("u1", Some("s2"), "b.txt", RATE_SHEET).await.unwrap());

    let first = h.pipeline.upload_chat("u1", "s1", "Yes, save it").await.unwrap();
    assert!(first.stored);
    assert!(first.duplicate.is_none());

    let second = h.pipeline.upload_chat("u1", "s2", "Yes, save it").await.unwrap();
    assert!(!second.stored);
    assert!(!second.indexed);
    assert_eq!(
        second.duplicate,
        Some(CatalogueConflict::DuplicateRedirect {
            session_id: "s1".into(),
            document_id: first_doc.clone(),
        })
    );
    assert_eq!(second.message, "Similar document already exists.");

    assert_eq!(h.offers.len(), 1);
    assert!(h.offers.get(&second_doc).await.unwrap().is_none());
    assert!(h.index.contains(&first_doc));
    assert!(!h.index.contains(&second_doc));
}

#[tokio::test]
async fn test_consent_renaming_to_catalogued_company_is_rejected() {
    let h = harness(
        ScriptedGateway::default()
            .reply("relevance_check", relevant())
            .reply("document_extraction", extraction("Bolt Capital"))
            .reply("upload_chat", consent("Acme Lending")),
    );
    let existing = OfferTerms {
        company_name: Some("Acme Lending".into()),
        ..Default::default()
    };
    h.offers.insert(&LoanOffer::new("doc-1", existing, "u9")).await.unwrap();

    let staged = staged_document(h.pipeline.upload("u1", Some("s3"), "bolt.txt", RATE_SHEET).await.unwrap());

    let outcome = h
        .pipeline
        .upload_chat("u1", "s3", "The company is actually Acme Lending, save it")
        .await
        .unwrap();
    assert!(!outcome.stored);
    assert_eq!(outcome.duplicate, Some(CatalogueConflict::DuplicateRejected));
    assert_eq!(
        outcome.message,
        "Similar document already exists. Contact admin for more information."
    );
    assert_eq!(h.offers.len(), 1);
    assert!(h.offers.get(&staged).await.unwrap().is_none());
    assert!(!h.index.contains(&staged));

    // The corrected terms stay pending on the session for another try.
    let session = h.sessions.get("s3").await.unwrap().unwrap();
    assert_eq!(
        session.document_snapshot.and_then(|t| t.company_name),
        Some("Acme Lending".to_string())
    );
}

#[tokio::test]
async fn test_upload_chat_sends_bounded_history() {
    let mut gateway = ScriptedGateway::default()
        .reply("relevance_check", relevant())
        .reply("document_extraction", extraction("Acme Lending"));
    for _ in 0..5 {
        gateway = gateway.reply(
            "upload_chat",
            json!({
                "extracted_info": {"company_name": "Acme Lending"},
                "message": "Noted. Save to the catalog?",
                "consent": false,
                "is_updated": true
            }),
        );
    }
    let h = harness(gateway);
    let pipeline = h.pipeline.clone().with_history_window(4);

    pipeline.upload("u1", Some("s1"), "sheet.txt", RATE_SHEET).await.unwrap();
    for i in 0..5 {
        pipeline.upload_chat("u1", "s1", &format!("correction {}", i)).await.unwrap();
    }

    let sent = h.gateway.sent("upload_chat");
    let counts: Vec<usize> = sent.iter().map(|(count, _)| *count).collect();
    assert_eq!(counts, vec![3, 5, 5, 5, 5]);
    assert_eq!(sent[4].1, "correction 4");
    assert_eq!(h.sessions.get("s1").await.unwrap().unwrap().messages.len(), 12);
}

#[tokio::test]
async fn test_long_document_is_capped_for_extraction() {
    let h = harness(
        ScriptedGateway::default()
            .reply("relevance_check", relevant())
            .reply("document_extraction", extraction("Acme Lending")),
    );
    let long = "Acme Lending bridge loans in CA. ".repeat(1_000);

    h.pipeline.upload("u1", Some("s1"), "long.txt", long.as_bytes()).await.unwrap();

    for schema in ["relevance_check", "document_extraction"] {
        let sent = h.gateway.sent(schema);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.chars().count(), 12_000);
    }
}
