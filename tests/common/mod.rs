//! Common test utilities and helpers

use anamnesis::store::libsql::LibsqlDocumentStore;
use anamnesis::store::{chat_entry_to_document, DocumentStore, CHAT_COLLECTION};
use anamnesis::{
    ChatEntryRef, ChatStatus, CodeChangeRef, LearningPipeline, PipelineConfig, Result,
    VcsInspector,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

/// Inspector returning a canned diff instead of shelling out to git
pub struct ScriptedInspector {
    pub files: BTreeSet<String>,
    pub diff_summary: String,
}

impl ScriptedInspector {
    pub fn touching(files: &[&str]) -> Self {
        Self {
            files: files.iter().map(|f| f.to_string()).collect(),
            diff_summary: format!("{} file(s) changed", files.len()),
        }
    }
}

#[async_trait]
impl VcsInspector for ScriptedInspector {
    async fn diff(
        &self,
        _from_ref: &str,
        to_ref: &str,
        _paths: Option<&[String]>,
    ) -> Result<CodeChangeRef> {
        Ok(CodeChangeRef {
            commit_ref: to_ref.to_string(),
            files: self.files.clone(),
            diff_summary: self.diff_summary.clone(),
            author: "dev".to_string(),
            timestamp: Utc::now(),
        })
    }
}

/// Build a pipeline over a temp data dir, in-memory store, and canned diff
pub async fn test_pipeline(
    dir: &TempDir,
    inspector: ScriptedInspector,
) -> (LearningPipeline, Arc<LibsqlDocumentStore>) {
    let config = PipelineConfig {
        data_dir: dir.path().to_path_buf(),
        database_path: ":memory:".to_string(),
        store_retry_backoff_ms: 1,
        ..Default::default()
    };
    let store = Arc::new(LibsqlDocumentStore::new_in_memory().await.unwrap());
    let pipeline = LearningPipeline::new(config, store.clone(), Arc::new(inspector)).unwrap();
    (pipeline, store)
}

/// One-test JUnit report with the given status
pub fn junit_report(test_id: &str, status: &str) -> Vec<u8> {
    let body = match status {
        "pass" => format!(r#"<testcase name="{}" time="0.1"/>"#, test_id),
        "fail" => format!(
            r#"<testcase name="{}" time="0.1"><failure message="assertion failed in module_x"/></testcase>"#,
            test_id
        ),
        "error" => format!(
            r#"<testcase name="{}" time="0.1"><error message="Exception raised in module_x"/></testcase>"#,
            test_id
        ),
        other => panic!("unsupported status fixture: {}", other),
    };
    format!(r#"<?xml version="1.0"?><testsuite name="t">{}</testsuite>"#, body).into_bytes()
}

/// Seed one captured chat entry touching the given path
pub async fn seed_chat(store: &LibsqlDocumentStore, chat_id: &str, path: &str) {
    let entry = ChatEntryRef {
        chat_id: chat_id.to_string(),
        session_id: "session-1".to_string(),
        prompt_summary: format!("why does the test touching {} fail", path),
        response_summary: "fixed an off-by-one".to_string(),
        involved_paths: [path.to_string()].into_iter().collect(),
        timestamp: Utc::now(),
        status: ChatStatus::Captured,
    };
    store
        .put(CHAT_COLLECTION, &chat_entry_to_document(&entry))
        .await
        .unwrap();
}
