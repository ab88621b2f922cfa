//! Document store layer
//!
//! Abstraction over the vector-database collaborator the pipeline consumes.
//! The pipeline only needs four operations (put, get by IDs, filtered query,
//! metadata update) over three logical collections: captured chat entries,
//! derived learnings, and raw code chunks for reference linking.

pub mod libsql;

use crate::error::{AnamnesisError, Result};
use crate::types::{ChatEntryRef, ChatStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::future::Future;
use tracing::warn;

/// Collection holding captured chat/discussion entries
pub const CHAT_COLLECTION: &str = "chat_entries";
/// Collection holding promoted derived learnings
pub const LEARNING_COLLECTION: &str = "derived_learnings";
/// Collection holding raw code chunks for reference linking
pub const CODE_CHUNK_COLLECTION: &str = "code_chunks";

/// One document as stored in a collection
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub content: String,
    pub metadata: Map<String, Value>,
}

/// Bounded filter applied before any similarity ranking
///
/// Both predicates are pushed down to the backend so query latency stays
/// independent of total history size.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    /// Inclusive timestamp range on the document's `timestamp` metadata
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Match documents whose `involved_paths` metadata intersects this set
    pub any_path: Option<BTreeSet<String>>,
    /// Exact-match metadata predicates, ANDed together
    pub metadata_equals: Vec<(String, Value)>,
}

/// Storage trait for the external document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace a document (idempotent by collection + id)
    async fn put(&self, collection: &str, document: &StoredDocument) -> Result<()>;

    /// Fetch documents by ID; missing IDs are silently absent from the result
    async fn get_by_ids(&self, collection: &str, ids: &[String]) -> Result<Vec<StoredDocument>>;

    /// Filtered query with optional similarity ranking over the filtered set
    async fn query(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        similarity_query: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredDocument>>;

    /// Merge a metadata patch into an existing document
    async fn update_metadata(
        &self,
        collection: &str,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<()>;
}

/// Retry a store write with bounded backoff
///
/// Exhausting the attempts surfaces [`AnamnesisError::StoreWrite`] to the
/// caller; the workflow stays in its current non-terminal state for a later
/// retry.
pub async fn with_retry<T, F, Fut>(
    attempts: u32,
    backoff: std::time::Duration,
    operation: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;
    for attempt in 1..=attempts.max(1) {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if matches!(e, AnamnesisError::Database(_) | AnamnesisError::StoreWrite(_)) => {
                warn!(operation, attempt, error = %e, "Store write failed; will retry");
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(backoff * attempt).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(AnamnesisError::StoreWrite(format!(
        "{} failed after {} attempts: {}",
        operation,
        attempts,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Serialize a chat entry into its stored-document form
pub fn chat_entry_to_document(entry: &ChatEntryRef) -> StoredDocument {
    let mut metadata = Map::new();
    metadata.insert("session_id".to_string(), json!(entry.session_id));
    metadata.insert(
        "involved_paths".to_string(),
        json!(entry.involved_paths.iter().collect::<Vec<_>>()),
    );
    metadata.insert("timestamp".to_string(), json!(entry.timestamp.to_rfc3339()));
    metadata.insert("status".to_string(), json!(entry.status.to_string()));
    metadata.insert("prompt_summary".to_string(), json!(entry.prompt_summary));
    metadata.insert(
        "response_summary".to_string(),
        json!(entry.response_summary),
    );

    StoredDocument {
        id: entry.chat_id.clone(),
        content: format!("{}\n{}", entry.prompt_summary, entry.response_summary),
        metadata,
    }
}

/// Reconstruct a chat entry from its stored-document form
pub fn chat_entry_from_document(doc: &StoredDocument) -> Result<ChatEntryRef> {
    let meta_str = |key: &str| -> String {
        doc.metadata
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };

    let timestamp = doc
        .metadata
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| {
            AnamnesisError::Other(format!("Chat entry {} has no valid timestamp", doc.id))
        })?;

    let involved_paths = doc
        .metadata
        .get("involved_paths")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect::<BTreeSet<_>>()
        })
        .unwrap_or_default();

    let status = match meta_str("status").as_str() {
        "analyzed" => ChatStatus::Analyzed,
        "promoted_to_learning" => ChatStatus::PromotedToLearning,
        "ignored" => ChatStatus::Ignored,
        _ => ChatStatus::Captured,
    };

    Ok(ChatEntryRef {
        chat_id: doc.id.clone(),
        session_id: meta_str("session_id"),
        prompt_summary: meta_str("prompt_summary"),
        response_summary: meta_str("response_summary"),
        involved_paths,
        timestamp,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> ChatEntryRef {
        ChatEntryRef {
            chat_id: "chat-1".to_string(),
            session_id: "session-9".to_string(),
            prompt_summary: "why does test_x fail".to_string(),
            response_summary: "off-by-one in module_x".to_string(),
            involved_paths: ["src/module_x.py".to_string()].into_iter().collect(),
            timestamp: Utc::now(),
            status: ChatStatus::Captured,
        }
    }

    #[test]
    fn test_chat_entry_document_roundtrip() {
        let entry = sample_entry();
        let doc = chat_entry_to_document(&entry);
        let back = chat_entry_from_document(&doc).unwrap();
        // Timestamps survive at second precision via rfc3339
        assert_eq!(back.chat_id, entry.chat_id);
        assert_eq!(back.session_id, entry.session_id);
        assert_eq!(back.involved_paths, entry.involved_paths);
        assert_eq!(back.status, entry.status);
    }

    #[test]
    fn test_chat_entry_missing_timestamp_is_error() {
        let mut doc = chat_entry_to_document(&sample_entry());
        doc.metadata.remove("timestamp");
        assert!(chat_entry_from_document(&doc).is_err());
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_with_store_write() {
        let result: Result<()> = with_retry(
            2,
            std::time::Duration::from_millis(1),
            "put learning",
            || async { Err(AnamnesisError::Database("down".to_string())) },
        )
        .await;
        assert!(matches!(result, Err(AnamnesisError::StoreWrite(_))));
    }

    #[tokio::test]
    async fn test_with_retry_passes_through_non_retryable() {
        let result: Result<()> = with_retry(
            3,
            std::time::Duration::from_millis(1),
            "put learning",
            || async { Err(AnamnesisError::WorkflowNotFound("wf".to_string())) },
        )
        .await;
        assert!(matches!(result, Err(AnamnesisError::WorkflowNotFound(_))));
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_after_transient_failure() {
        let mut calls = 0;
        let result = with_retry(
            3,
            std::time::Duration::from_millis(1),
            "put learning",
            || {
                calls += 1;
                let attempt = calls;
                async move {
                    if attempt < 2 {
                        Err(AnamnesisError::Database("transient".to_string()))
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(result, 2);
    }
}
