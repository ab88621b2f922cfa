//! Core data types for the Anamnesis validation pipeline
//!
//! This module defines the fundamental data structures used throughout the
//! pipeline: test outcomes and transitions, the durable workflow record with
//! its state machine, correlation references, and validation evidence. These
//! types form the foundation of evidence-based learning validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Unique identifier for workflows
///
/// Wraps a UUID to provide type safety and prevent mixing workflow IDs
/// with other UUID-based identifiers in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Create a new random workflow ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a workflow ID from a string
    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for derived learnings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LearningId(pub Uuid);

impl LearningId {
    /// Create a new random learning ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a learning ID from a string
    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for LearningId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LearningId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a single test in one report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
    Skipped,
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestStatus::Pass => write!(f, "pass"),
            TestStatus::Fail => write!(f, "fail"),
            TestStatus::Error => write!(f, "error"),
            TestStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Normalized result of a single test in one ingested report
///
/// Immutable once parsed; one set is produced per report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub test_id: String,
    pub status: TestStatus,
    pub duration_ms: u64,
    pub failure_message: Option<String>,
    pub report_timestamp: DateTime<Utc>,
}

/// Classification of a status change between two reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// fail|error -> pass: the signal this pipeline exists for
    Fixed,
    /// pass -> fail|error: recorded, never promoted
    Regressed,
    /// Any other status change (e.g. skipped -> pass)
    Other,
}

impl TransitionKind {
    /// Classify a before/after status pair
    pub fn of(before: TestStatus, after: TestStatus) -> Self {
        match (before, after) {
            (TestStatus::Fail | TestStatus::Error, TestStatus::Pass) => TransitionKind::Fixed,
            (TestStatus::Pass, TestStatus::Fail | TestStatus::Error) => TransitionKind::Regressed,
            _ => TransitionKind::Other,
        }
    }

    /// Whether this transition kind may feed the promotion engine
    pub fn is_promotable(&self) -> bool {
        matches!(self, TransitionKind::Fixed)
    }
}

/// A change in a single test's status between two report snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestTransition {
    pub test_id: String,
    pub before_status: TestStatus,
    pub after_status: TestStatus,
    pub before_report_ref: String,
    pub after_report_ref: String,
    pub detected_at: DateTime<Utc>,
}

impl TestTransition {
    /// Classify this transition
    pub fn kind(&self) -> TransitionKind {
        TransitionKind::of(self.before_status, self.after_status)
    }
}

/// Workflow lifecycle states
///
/// States advance monotonically: `PendingAfter -> ReadyForCorrelation ->
/// Correlated -> Scored -> {Promoted | Rejected}`, with `Expired` reachable
/// from any non-terminal state. `Promoted`, `Rejected` and `Expired` are
/// terminal and only reachable once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    PendingAfter,
    ReadyForCorrelation,
    Correlated,
    Scored,
    Promoted,
    Rejected,
    Expired,
}

impl WorkflowState {
    /// Whether this state is terminal (record becomes read-only)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Promoted | WorkflowState::Rejected | WorkflowState::Expired
        )
    }

    /// Position in the forward progression; terminal states share the top slot
    fn rank(&self) -> u8 {
        match self {
            WorkflowState::PendingAfter => 0,
            WorkflowState::ReadyForCorrelation => 1,
            WorkflowState::Correlated => 2,
            WorkflowState::Scored => 3,
            WorkflowState::Promoted | WorkflowState::Rejected | WorkflowState::Expired => 4,
        }
    }

    /// Whether the state machine permits advancing from `self` to `next`
    ///
    /// Terminal states accept nothing. `Rejected` and `Expired` are reachable
    /// from any non-terminal state; everything else must advance strictly
    /// forward by rank.
    pub fn can_advance_to(&self, next: WorkflowState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            WorkflowState::Rejected | WorkflowState::Expired => true,
            WorkflowState::Promoted => *self == WorkflowState::Scored,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowState::PendingAfter => "pending_after",
            WorkflowState::ReadyForCorrelation => "ready_for_correlation",
            WorkflowState::Correlated => "correlated",
            WorkflowState::Scored => "scored",
            WorkflowState::Promoted => "promoted",
            WorkflowState::Rejected => "rejected",
            WorkflowState::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

/// Durable record tracking one before/after test-run pair through to a
/// promotion or rejection decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: WorkflowId,
    pub commit_ref: Option<String>,
    pub before_report_ref: String,
    pub after_report_ref: Option<String>,
    pub state: WorkflowState,
    /// Set on promotion so reconciliation can find orphaned learnings
    pub learning_id: Option<LearningId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Open a new workflow for a freshly ingested "before" report
    pub fn open(before_report_ref: String, commit_ref: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: WorkflowId::new(),
            commit_ref,
            before_report_ref,
            after_report_ref: None,
            state: WorkflowState::PendingAfter,
            learning_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Denormalized summary of one code change, obtained on demand from the
/// version-control inspector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeChangeRef {
    pub commit_ref: String,
    pub files: BTreeSet<String>,
    pub diff_summary: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle status of a captured chat entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    Captured,
    Analyzed,
    PromotedToLearning,
    Ignored,
}

impl std::fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChatStatus::Captured => "captured",
            ChatStatus::Analyzed => "analyzed",
            ChatStatus::PromotedToLearning => "promoted_to_learning",
            ChatStatus::Ignored => "ignored",
        };
        write!(f, "{}", s)
    }
}

/// A chat/discussion entry sourced from the document store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntryRef {
    pub chat_id: String,
    pub session_id: String,
    pub prompt_summary: String,
    pub response_summary: String,
    pub involved_paths: BTreeSet<String>,
    pub timestamp: DateTime<Utc>,
    pub status: ChatStatus,
}

/// Categories of validation evidence
///
/// New kinds are addable without touching the scorer's dispatch: the scorer
/// only reads the tag and weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    TestTransition,
    QualityImprovement,
    ErrorResolution,
    KnowledgeGap,
}

impl std::fmt::Display for EvidenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvidenceType::TestTransition => "test_transition",
            EvidenceType::QualityImprovement => "quality_improvement",
            EvidenceType::ErrorResolution => "error_resolution",
            EvidenceType::KnowledgeGap => "knowledge_gap",
        };
        write!(f, "{}", s)
    }
}

/// A typed, weighted observation supporting that an interaction produced
/// real engineering value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationEvidence {
    pub evidence_type: EvidenceType,
    pub weight: f64,
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl ValidationEvidence {
    /// Build an evidence item with a detail map from key/value pairs
    pub fn new(
        evidence_type: EvidenceType,
        weight: f64,
        details: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) -> Self {
        Self {
            evidence_type,
            weight,
            details: details.into_iter().collect(),
        }
    }
}

/// Transient scoring result; exists only between scoring and promotion
#[derive(Debug, Clone)]
pub struct LearningCandidate {
    pub workflow_id: WorkflowId,
    pub score: f64,
    pub evidence: Vec<ValidationEvidence>,
    pub chat_id: Option<String>,
    pub code_ref: Option<CodeChangeRef>,
}

/// A validated learning persisted permanently in the curated store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedLearning {
    pub learning_id: LearningId,
    pub description: String,
    pub pattern: String,
    pub source_chat_id: Option<String>,
    pub code_reference: Option<String>,
    pub validation_evidence: Vec<ValidationEvidence>,
    pub confidence: f64,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}
