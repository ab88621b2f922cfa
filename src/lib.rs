//! Anamnesis - Evidence-Based Learning Validation Pipeline
//!
//! A Rust pipeline that decides which developer-AI interactions represent
//! validated engineering learning:
//! - Parses structured test reports and detects fail -> pass transitions
//! - Tracks each before/after run pair as a durable workflow record
//! - Correlates transitions with code diffs and captured chat entries
//! - Scores the gathered evidence with fixed per-category weights
//! - Promotes high-scoring candidates into a curated learnings collection
//!   with bidirectional links back to their evidence
//!
//! # Architecture
//!
//! The system is organized into several layers:
//! - **Types**: Core data structures (TestOutcome, Workflow, DerivedLearning)
//! - **Tracker**: Durable workflow state surviving process restarts
//! - **Store**: Document-store seam with a libSQL backend
//! - **Pipeline**: Orchestration of correlation, scoring and promotion
//!
//! # Example
//!
//! ```ignore
//! use anamnesis::{LearningPipeline, PipelineConfig};
//! use anamnesis::store::libsql::LibsqlDocumentStore;
//! use anamnesis::vcs::GitInspector;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load(None)?;
//!     let store = Arc::new(LibsqlDocumentStore::new_local(&config.database_path).await?);
//!     let inspector = Arc::new(GitInspector::new("."));
//!     let pipeline = LearningPipeline::new(config, store, inspector)?;
//!
//!     // Ingest a pre-fix report, then a post-fix report for the same commit
//!     pipeline.ingest(&std::fs::read("before.xml")?, Some("abc123".into()), None)?;
//!     pipeline.ingest(&std::fs::read("after.xml")?, Some("abc123".into()), None)?;
//!
//!     // Correlate, score and promote
//!     let summary = pipeline.process_ready().await?;
//!     println!("promoted: {}", summary.promoted.len());
//!     Ok(())
//! }
//! ```

pub mod cleanup;
pub mod config;
pub mod correlate;
pub mod error;
pub mod pipeline;
pub mod promote;
pub mod report;
pub mod score;
pub mod store;
pub mod tracker;
pub mod transition;
pub mod types;
pub mod vcs;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{AnamnesisError, Result};
pub use pipeline::{IngestOutcome, LearningPipeline, ProcessSummary};
pub use store::{DocumentFilter, DocumentStore, StoredDocument};
pub use tracker::WorkflowTracker;
pub use types::{
    ChatEntryRef, ChatStatus, CodeChangeRef, DerivedLearning, EvidenceType, LearningCandidate,
    LearningId, TestOutcome, TestStatus, TestTransition, TransitionKind, ValidationEvidence,
    Workflow, WorkflowId, WorkflowState,
};
pub use vcs::{GitInspector, VcsInspector};
