//! Promotion engine
//!
//! The one operation in the pipeline with a multi-step side effect: writing
//! the derived learning and updating the source chat entry's status. The
//! learning write is retried with bounded backoff; a learning that lands
//! while the chat update fails is a partial promotion — logged at ERROR with
//! both IDs, and the workflow stays in `scored` so a reconciliation sweep
//! can finish the job. The pipeline never leaves an orphaned learning marked
//! as fully consistent.

use crate::error::{AnamnesisError, Result};
use crate::store::{DocumentStore, StoredDocument, CHAT_COLLECTION, LEARNING_COLLECTION};
use crate::tracker::WorkflowTracker;
use crate::types::{
    ChatStatus, DerivedLearning, LearningCandidate, LearningId, Workflow, WorkflowState,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Promotes scored candidates into the curated learning collection
pub struct PromotionEngine {
    store: Arc<dyn DocumentStore>,
    threshold: f64,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl PromotionEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        threshold: f64,
        retry_attempts: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            store,
            threshold,
            retry_attempts,
            retry_backoff,
        }
    }

    /// Promote a candidate, or reject it if below threshold
    ///
    /// Idempotent: promoting an already-`promoted` workflow returns the
    /// recorded learning without a second insert. Returns `None` (and sets
    /// the workflow `rejected`) when the score is below the threshold.
    pub async fn promote(
        &self,
        tracker: &WorkflowTracker,
        workflow: &Workflow,
        candidate: &LearningCandidate,
    ) -> Result<Option<DerivedLearning>> {
        let workflow_id = workflow.workflow_id;

        if workflow.state == WorkflowState::Promoted {
            info!(workflow_id = %workflow_id, "Workflow already promoted; no-op");
            return self.existing_learning(workflow).await;
        }

        if candidate.score < self.threshold {
            info!(
                workflow_id = %workflow_id,
                score = candidate.score,
                threshold = self.threshold,
                "Candidate below threshold; rejecting workflow"
            );
            tracker.advance(workflow_id, WorkflowState::Rejected, |_| {})?;
            return Ok(None);
        }

        let learning = build_learning(candidate);
        let document = learning_to_document(&learning, candidate);

        crate::store::with_retry(
            self.retry_attempts,
            self.retry_backoff,
            "put derived learning",
            || async { self.store.put(LEARNING_COLLECTION, &document).await },
        )
        .await?;

        // Bidirectional link back: the chat entry learns which learning
        // consumed it, in the same logical operation as the learning write
        if let Some(chat_id) = &candidate.chat_id {
            let mut patch = Map::new();
            patch.insert(
                "status".to_string(),
                json!(ChatStatus::PromotedToLearning.to_string()),
            );
            patch.insert("learning_id".to_string(), json!(learning.learning_id.to_string()));

            let update = crate::store::with_retry(
                self.retry_attempts,
                self.retry_backoff,
                "update chat status",
                || async { self.store.update_metadata(CHAT_COLLECTION, chat_id, &patch).await },
            )
            .await;

            if let Err(e) = update {
                error!(
                    workflow_id = %workflow_id,
                    learning_id = %learning.learning_id,
                    chat_id,
                    error = %e,
                    "Learning written but chat status update failed; leaving workflow scored for reconciliation"
                );
                return Err(AnamnesisError::PartialPromotion {
                    learning_id: learning.learning_id.to_string(),
                    chat_id: chat_id.clone(),
                });
            }
        }

        let learning_id = learning.learning_id;
        tracker.advance(workflow_id, WorkflowState::Promoted, |w| {
            w.learning_id = Some(learning_id);
        })?;
        info!(
            workflow_id = %workflow_id,
            learning_id = %learning_id,
            score = candidate.score,
            "Promoted derived learning"
        );
        Ok(Some(learning))
    }

    /// Complete a partial promotion detected on a `scored` workflow
    ///
    /// Looks for a learning already written against the workflow; when one
    /// exists, retries the chat status update and finishes the promotion.
    /// Returns the learning when reconciliation completed, `None` when there
    /// was nothing to reconcile.
    pub async fn reconcile(
        &self,
        tracker: &WorkflowTracker,
        workflow: &Workflow,
    ) -> Result<Option<DerivedLearning>> {
        let filter = crate::store::DocumentFilter {
            metadata_equals: vec![(
                "workflow_id".to_string(),
                json!(workflow.workflow_id.to_string()),
            )],
            ..Default::default()
        };
        let orphans = self
            .store
            .query(LEARNING_COLLECTION, &filter, None, 1)
            .await?;
        let Some(doc) = orphans.first() else {
            return Ok(None);
        };

        let learning = learning_from_document(doc)?;
        warn!(
            workflow_id = %workflow.workflow_id,
            learning_id = %learning.learning_id,
            "Found orphaned learning for scored workflow; completing promotion"
        );

        if let Some(chat_id) = &learning.source_chat_id {
            let mut patch = Map::new();
            patch.insert(
                "status".to_string(),
                json!(ChatStatus::PromotedToLearning.to_string()),
            );
            patch.insert("learning_id".to_string(), json!(learning.learning_id.to_string()));
            self.store
                .update_metadata(CHAT_COLLECTION, chat_id, &patch)
                .await?;
        }

        let learning_id = learning.learning_id;
        tracker.advance(workflow.workflow_id, WorkflowState::Promoted, |w| {
            w.learning_id = Some(learning_id);
        })?;
        Ok(Some(learning))
    }

    async fn existing_learning(&self, workflow: &Workflow) -> Result<Option<DerivedLearning>> {
        let Some(learning_id) = workflow.learning_id else {
            warn!(
                workflow_id = %workflow.workflow_id,
                "Promoted workflow has no recorded learning ID"
            );
            return Ok(None);
        };
        let docs = self
            .store
            .get_by_ids(LEARNING_COLLECTION, &[learning_id.to_string()])
            .await?;
        match docs.first() {
            Some(doc) => Ok(Some(learning_from_document(doc)?)),
            None => Ok(None),
        }
    }
}

/// Build the learning record from the candidate's evidence
///
/// Description and pattern come from the chat summaries and diff summary;
/// with no chat evidence the pattern is derived from the diff summary and
/// test identifiers alone.
fn build_learning(candidate: &LearningCandidate) -> DerivedLearning {
    let test_ids: Vec<String> = candidate
        .evidence
        .iter()
        .filter_map(|e| e.details.get("test_id"))
        .filter_map(|v| v.as_str().map(String::from))
        .collect();

    let diff_summary = candidate
        .code_ref
        .as_ref()
        .map(|c| c.diff_summary.clone())
        .unwrap_or_default();

    let (description, pattern) = match &candidate.chat_id {
        Some(chat_id) => {
            let chat_line = candidate
                .evidence
                .iter()
                .find_map(|e| e.details.get("chat_summary"))
                .and_then(|v| v.as_str())
                .unwrap_or("developer/AI discussion");
            (
                format!(
                    "Validated fix for {}: {} (chat {})",
                    test_ids.join(", "),
                    chat_line,
                    chat_id
                ),
                format!("{} | {}", chat_line, diff_summary),
            )
        }
        None => (
            format!(
                "Validated fix for {} with no chat context",
                test_ids.join(", ")
            ),
            format!("tests: {} | {}", test_ids.join(", "), diff_summary),
        ),
    };

    let mut tags = vec!["validated".to_string(), "test_transition".to_string()];
    tags.extend(test_ids.iter().cloned());

    DerivedLearning {
        learning_id: LearningId::new(),
        description,
        pattern,
        source_chat_id: candidate.chat_id.clone(),
        code_reference: candidate.code_ref.as_ref().map(|c| c.commit_ref.clone()),
        validation_evidence: candidate.evidence.clone(),
        confidence: candidate.score,
        tags,
        created_at: Utc::now(),
    }
}

/// Serialize a learning into its stored-document form
fn learning_to_document(learning: &DerivedLearning, candidate: &LearningCandidate) -> StoredDocument {
    let mut metadata = Map::new();
    metadata.insert(
        "workflow_id".to_string(),
        json!(candidate.workflow_id.to_string()),
    );
    metadata.insert("pattern".to_string(), json!(learning.pattern));
    metadata.insert(
        "source_chat_id".to_string(),
        learning
            .source_chat_id
            .as_ref()
            .map(|c| json!(c))
            .unwrap_or(Value::Null),
    );
    metadata.insert(
        "code_reference".to_string(),
        learning
            .code_reference
            .as_ref()
            .map(|c| json!(c))
            .unwrap_or(Value::Null),
    );
    metadata.insert("confidence".to_string(), json!(learning.confidence));
    metadata.insert("tags".to_string(), json!(learning.tags));
    metadata.insert(
        "timestamp".to_string(),
        json!(learning.created_at.to_rfc3339()),
    );
    metadata.insert(
        "validation_evidence".to_string(),
        serde_json::to_value(&learning.validation_evidence).unwrap_or(Value::Null),
    );

    StoredDocument {
        id: learning.learning_id.to_string(),
        content: learning.description.clone(),
        metadata,
    }
}

/// Reconstruct a learning from its stored-document form
fn learning_from_document(doc: &StoredDocument) -> Result<DerivedLearning> {
    let learning_id = LearningId::from_string(&doc.id)?;
    let meta_str = |key: &str| -> Option<String> {
        doc.metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(String::from)
    };

    let created_at = meta_str("timestamp")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let validation_evidence = doc
        .metadata
        .get("validation_evidence")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();

    let tags = doc
        .metadata
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    Ok(DerivedLearning {
        learning_id,
        description: doc.content.clone(),
        pattern: meta_str("pattern").unwrap_or_default(),
        source_chat_id: meta_str("source_chat_id"),
        code_reference: meta_str("code_reference"),
        validation_evidence,
        confidence: doc
            .metadata
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        tags,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::score;
    use crate::store::libsql::LibsqlDocumentStore;
    use crate::store::{chat_entry_to_document, DocumentFilter};
    use crate::types::{
        ChatEntryRef, CodeChangeRef, EvidenceType, ValidationEvidence,
    };
    use tempfile::TempDir;

    fn test_tracker(dir: &TempDir) -> WorkflowTracker {
        let config = PipelineConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        WorkflowTracker::new(&config).unwrap()
    }

    async fn engine(store: Arc<LibsqlDocumentStore>) -> PromotionEngine {
        PromotionEngine::new(store, 0.5, 3, Duration::from_millis(1))
    }

    fn scored_workflow(tracker: &WorkflowTracker) -> Workflow {
        let wf = tracker.open("r1", Some("abc123".into())).unwrap();
        tracker.attach_after(wf.workflow_id, "r2").unwrap();
        tracker
            .advance(wf.workflow_id, WorkflowState::Correlated, |_| {})
            .unwrap();
        tracker
            .advance(wf.workflow_id, WorkflowState::Scored, |_| {})
            .unwrap()
    }

    fn candidate(workflow: &Workflow, chat_id: Option<&str>, score_value: f64) -> LearningCandidate {
        let evidence = vec![ValidationEvidence::new(
            EvidenceType::TestTransition,
            score::TEST_TRANSITION_WEIGHT,
            [("test_id".to_string(), json!("test_x"))],
        )];
        LearningCandidate {
            workflow_id: workflow.workflow_id,
            score: score_value,
            evidence,
            chat_id: chat_id.map(String::from),
            code_ref: Some(CodeChangeRef {
                commit_ref: "abc123".to_string(),
                files: ["src/module_x.py".to_string()].into_iter().collect(),
                diff_summary: "1 file changed".to_string(),
                author: "dev".to_string(),
                timestamp: Utc::now(),
            }),
        }
    }

    fn chat(chat_id: &str) -> ChatEntryRef {
        ChatEntryRef {
            chat_id: chat_id.to_string(),
            session_id: "s1".to_string(),
            prompt_summary: "why does test_x fail".to_string(),
            response_summary: "off-by-one".to_string(),
            involved_paths: ["src/module_x.py".to_string()].into_iter().collect(),
            timestamp: Utc::now(),
            status: ChatStatus::Analyzed,
        }
    }

    #[tokio::test]
    async fn test_below_threshold_rejects_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let tracker = test_tracker(&dir);
        let store = Arc::new(LibsqlDocumentStore::new_in_memory().await.unwrap());
        let engine = engine(store.clone()).await;

        let wf = scored_workflow(&tracker);
        let result = engine
            .promote(&tracker, &wf, &candidate(&wf, None, 0.3))
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(tracker.get(wf.workflow_id).unwrap().state, WorkflowState::Rejected);

        let learnings = store
            .query(LEARNING_COLLECTION, &DocumentFilter::default(), None, 10)
            .await
            .unwrap();
        assert!(learnings.is_empty());
    }

    #[tokio::test]
    async fn test_promotion_writes_learning_and_flips_chat_status() {
        let dir = TempDir::new().unwrap();
        let tracker = test_tracker(&dir);
        let store = Arc::new(LibsqlDocumentStore::new_in_memory().await.unwrap());
        store
            .put(CHAT_COLLECTION, &chat_entry_to_document(&chat("chat-1")))
            .await
            .unwrap();
        let engine = engine(store.clone()).await;

        let wf = scored_workflow(&tracker);
        let learning = engine
            .promote(&tracker, &wf, &candidate(&wf, Some("chat-1"), 0.8))
            .await
            .unwrap()
            .expect("should promote");

        assert_eq!(learning.source_chat_id.as_deref(), Some("chat-1"));
        assert_eq!(learning.confidence, 0.8);

        let updated = tracker.get(wf.workflow_id).unwrap();
        assert_eq!(updated.state, WorkflowState::Promoted);
        assert_eq!(updated.learning_id, Some(learning.learning_id));

        let chat_doc = store
            .get_by_ids(CHAT_COLLECTION, &["chat-1".to_string()])
            .await
            .unwrap();
        assert_eq!(
            chat_doc[0].metadata.get("status"),
            Some(&json!("promoted_to_learning"))
        );
        assert_eq!(
            chat_doc[0].metadata.get("learning_id"),
            Some(&json!(learning.learning_id.to_string()))
        );
    }

    #[tokio::test]
    async fn test_promote_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let tracker = test_tracker(&dir);
        let store = Arc::new(LibsqlDocumentStore::new_in_memory().await.unwrap());
        let engine = engine(store.clone()).await;

        let wf = scored_workflow(&tracker);
        let cand = candidate(&wf, None, 0.8);
        let first = engine.promote(&tracker, &wf, &cand).await.unwrap().unwrap();

        let promoted = tracker.get(wf.workflow_id).unwrap();
        let second = engine
            .promote(&tracker, &promoted, &cand)
            .await
            .unwrap()
            .expect("existing learning returned");

        assert_eq!(first.learning_id, second.learning_id);
        let learnings = store
            .query(LEARNING_COLLECTION, &DocumentFilter::default(), None, 10)
            .await
            .unwrap();
        assert_eq!(learnings.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_chat_entry_is_partial_promotion() {
        let dir = TempDir::new().unwrap();
        let tracker = test_tracker(&dir);
        let store = Arc::new(LibsqlDocumentStore::new_in_memory().await.unwrap());
        // Chat entry deliberately absent: update_metadata will fail
        let engine = engine(store.clone()).await;

        let wf = scored_workflow(&tracker);
        let err = engine
            .promote(&tracker, &wf, &candidate(&wf, Some("ghost-chat"), 0.8))
            .await
            .unwrap_err();

        assert!(matches!(err, AnamnesisError::PartialPromotion { .. }));
        // Workflow stays scored so reconciliation can pick it up
        assert_eq!(tracker.get(wf.workflow_id).unwrap().state, WorkflowState::Scored);
    }

    #[tokio::test]
    async fn test_reconcile_completes_partial_promotion() {
        let dir = TempDir::new().unwrap();
        let tracker = test_tracker(&dir);
        let store = Arc::new(LibsqlDocumentStore::new_in_memory().await.unwrap());
        let engine = engine(store.clone()).await;

        let wf = scored_workflow(&tracker);
        let err = engine
            .promote(&tracker, &wf, &candidate(&wf, Some("chat-late"), 0.8))
            .await
            .unwrap_err();
        assert!(matches!(err, AnamnesisError::PartialPromotion { .. }));

        // The chat entry arrives (or the store recovers); reconcile finishes
        store
            .put(CHAT_COLLECTION, &chat_entry_to_document(&chat("chat-late")))
            .await
            .unwrap();

        let scored = tracker.get(wf.workflow_id).unwrap();
        let learning = engine
            .reconcile(&tracker, &scored)
            .await
            .unwrap()
            .expect("orphan reconciled");

        assert_eq!(tracker.get(wf.workflow_id).unwrap().state, WorkflowState::Promoted);
        let chat_doc = store
            .get_by_ids(CHAT_COLLECTION, &["chat-late".to_string()])
            .await
            .unwrap();
        assert_eq!(
            chat_doc[0].metadata.get("learning_id"),
            Some(&json!(learning.learning_id.to_string()))
        );
    }

    #[tokio::test]
    async fn test_diff_only_pattern_without_chat() {
        let dir = TempDir::new().unwrap();
        let tracker = test_tracker(&dir);
        let store = Arc::new(LibsqlDocumentStore::new_in_memory().await.unwrap());
        let engine = engine(store).await;

        let wf = scored_workflow(&tracker);
        let learning = engine
            .promote(&tracker, &wf, &candidate(&wf, None, 0.6))
            .await
            .unwrap()
            .unwrap();

        assert!(learning.source_chat_id.is_none());
        assert!(learning.pattern.contains("test_x"));
        assert!(learning.pattern.contains("1 file changed"));
    }
}
