//! Evidence correlator
//!
//! Joins a workflow's test transitions with the code change that produced
//! them and any chat entries captured around the fix. The chat join is a
//! bounded query: time range and path intersection are both applied in the
//! store before any similarity ranking, so correctness never depends on
//! process lifetime or an in-memory cache of "recent" chats.

use crate::error::{AnamnesisError, Result};
use crate::score;
use crate::store::{
    chat_entry_from_document, DocumentFilter, DocumentStore, CHAT_COLLECTION,
    CODE_CHUNK_COLLECTION,
};
use crate::types::{
    ChatEntryRef, ChatStatus, CodeChangeRef, EvidenceType, TestOutcome, TestTransition,
    ValidationEvidence, Workflow,
};
use crate::vcs::VcsInspector;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Cap on chat entries considered per workflow
const MAX_CHAT_MATCHES: usize = 10;

/// Cap on code chunks linked per workflow
const MAX_CODE_CHUNK_LINKS: usize = 10;

/// Failure-message markers that indicate a runtime exception rather than a
/// plain assertion failure
const EXCEPTION_MARKERS: &[&str] = &["panicked at", "Exception", "Traceback", "Error:"];

/// Everything correlation learned about one workflow
#[derive(Debug, Clone)]
pub struct CorrelationOutcome {
    pub evidence: Vec<ValidationEvidence>,
    pub code_ref: CodeChangeRef,
    pub chats: Vec<ChatEntryRef>,
}

/// Correlates transitions with code changes and chat evidence
pub struct EvidenceCorrelator {
    store: Arc<dyn DocumentStore>,
    inspector: Arc<dyn VcsInspector>,
    window: Duration,
}

impl EvidenceCorrelator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        inspector: Arc<dyn VcsInspector>,
        window: Duration,
    ) -> Self {
        Self {
            store,
            inspector,
            window,
        }
    }

    /// Gather validation evidence for a workflow's detected transitions
    ///
    /// Code evidence is required: a transition that cannot be tied to any
    /// code change is impossible by construction and signals an ingestion
    /// error, so the workflow is routed to `rejected` by the caller via
    /// [`AnamnesisError::CorrelationInconclusive`]. Missing chat evidence is
    /// fine; promotion can proceed on the test transition alone.
    pub async fn correlate(
        &self,
        workflow: &Workflow,
        transitions: &[TestTransition],
        before_outcomes: &[TestOutcome],
        before_capture: DateTime<Utc>,
        after_capture: DateTime<Utc>,
    ) -> Result<CorrelationOutcome> {
        let workflow_id = workflow.workflow_id;

        let Some(commit_ref) = workflow.commit_ref.as_deref() else {
            warn!(
                workflow_id = %workflow_id,
                "No commit recorded for workflow; correlation inconclusive"
            );
            return Err(AnamnesisError::CorrelationInconclusive {
                workflow_id: workflow_id.to_string(),
                reason: "no commit recorded".to_string(),
            });
        };

        // One CodeChangeRef per workflow: the commit recorded at ingest time,
        // diffed against its parent. Multi-commit aggregation is out of scope.
        let parent = format!("{}~1", commit_ref);
        let code_ref = self.inspector.diff(&parent, commit_ref, None).await?;

        if code_ref.files.is_empty() {
            warn!(
                workflow_id = %workflow_id,
                commit_ref,
                "Commit diff touched no files; correlation inconclusive"
            );
            return Err(AnamnesisError::CorrelationInconclusive {
                workflow_id: workflow_id.to_string(),
                reason: format!("empty diff for commit {}", commit_ref),
            });
        }

        let promotable: Vec<&TestTransition> = transitions
            .iter()
            .filter(|t| t.kind().is_promotable())
            .collect();

        let chats = self
            .find_chat_evidence(&code_ref, &promotable, before_capture, after_capture)
            .await?;
        let chunk_ids = self.find_code_chunks(&code_ref).await?;

        let mut evidence = Vec::new();
        for transition in &promotable {
            let mut item = ValidationEvidence::new(
                EvidenceType::TestTransition,
                score::weight_for(EvidenceType::TestTransition),
                [
                    ("test_id".to_string(), json!(transition.test_id)),
                    (
                        "before_status".to_string(),
                        json!(transition.before_status.to_string()),
                    ),
                    (
                        "after_status".to_string(),
                        json!(transition.after_status.to_string()),
                    ),
                    ("commit_ref".to_string(), json!(code_ref.commit_ref)),
                    ("diff_summary".to_string(), json!(code_ref.diff_summary)),
                ],
            );
            if !chunk_ids.is_empty() {
                item.details
                    .insert("code_chunk_ids".to_string(), json!(chunk_ids));
            }
            evidence.push(item);
        }

        // An exception-shaped failure message that the fix's diff plausibly
        // resolved is stronger evidence than a bare assertion flip
        if let Some(marker) = resolved_exception(&promotable, before_outcomes, &code_ref) {
            evidence.push(ValidationEvidence::new(
                EvidenceType::ErrorResolution,
                score::weight_for(EvidenceType::ErrorResolution),
                [
                    ("marker".to_string(), json!(marker)),
                    ("commit_ref".to_string(), json!(code_ref.commit_ref)),
                ],
            ));
        }

        debug!(
            workflow_id = %workflow_id,
            evidence_items = evidence.len(),
            chat_matches = chats.len(),
            changed_files = code_ref.files.len(),
            "Correlation complete"
        );

        Ok(CorrelationOutcome {
            evidence,
            code_ref,
            chats,
        })
    }

    /// Bounded time+path join against the chat collection
    async fn find_chat_evidence(
        &self,
        code_ref: &CodeChangeRef,
        promotable: &[&TestTransition],
        before_capture: DateTime<Utc>,
        after_capture: DateTime<Utc>,
    ) -> Result<Vec<ChatEntryRef>> {
        let filter = DocumentFilter {
            time_range: Some((before_capture - self.window, after_capture + self.window)),
            any_path: Some(code_ref.files.clone()),
            metadata_equals: vec![],
        };

        let similarity_query = promotable
            .iter()
            .map(|t| t.test_id.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let similarity = (!similarity_query.is_empty()).then_some(similarity_query.as_str());

        let documents = self
            .store
            .query(CHAT_COLLECTION, &filter, similarity, MAX_CHAT_MATCHES)
            .await?;

        let mut chats = Vec::new();
        for doc in &documents {
            match chat_entry_from_document(doc) {
                Ok(entry) => chats.push(entry),
                Err(e) => warn!(chat_id = %doc.id, error = %e, "Skipping undecodable chat entry"),
            }
        }

        // Mark freshly considered chats so repeated sweeps can skip them
        for chat in &mut chats {
            if chat.status == ChatStatus::Captured {
                let mut patch = serde_json::Map::new();
                patch.insert("status".to_string(), json!(ChatStatus::Analyzed.to_string()));
                self.store
                    .update_metadata(CHAT_COLLECTION, &chat.chat_id, &patch)
                    .await?;
                chat.status = ChatStatus::Analyzed;
            }
        }

        Ok(chats)
    }

    /// Link stored code chunks touching the same files as the diff
    ///
    /// Gives the derived learning a durable reference into the code-chunk
    /// collection even after the commit is rebased away.
    async fn find_code_chunks(&self, code_ref: &CodeChangeRef) -> Result<Vec<String>> {
        let filter = DocumentFilter {
            any_path: Some(code_ref.files.clone()),
            ..Default::default()
        };
        let documents = self
            .store
            .query(CODE_CHUNK_COLLECTION, &filter, None, MAX_CODE_CHUNK_LINKS)
            .await?;
        Ok(documents.into_iter().map(|d| d.id).collect())
    }
}

/// Detect a runtime exception in a fixed test's prior failure that the diff
/// plausibly resolved
///
/// The check is file-path-level: the failure message must carry an exception
/// marker and mention one of the changed files (path or file stem).
/// Line-level blame is deliberately not attempted at this evidence weight.
fn resolved_exception(
    promotable: &[&TestTransition],
    before_outcomes: &[TestOutcome],
    code_ref: &CodeChangeRef,
) -> Option<&'static str> {
    for transition in promotable {
        let message = before_outcomes
            .iter()
            .find(|o| o.test_id == transition.test_id)
            .and_then(|o| o.failure_message.as_deref());
        let Some(message) = message else { continue };

        let marker = EXCEPTION_MARKERS.iter().find(|m| message.contains(**m));
        let Some(marker) = marker else { continue };

        let touches_changed_file = code_ref.files.iter().any(|file| {
            message.contains(file.as_str())
                || std::path::Path::new(file)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(|stem| message.contains(stem))
                    .unwrap_or(false)
        });
        if touches_changed_file {
            return Some(marker);
        }
    }
    None
}
