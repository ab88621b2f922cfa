//! Pipeline orchestration
//!
//! Wires the ingestor, transition detector, tracker, correlator, scorer and
//! promotion engine into the three externally triggered entry points: ingest
//! a report, process ready workflows, and sweep expired ones. The pipeline
//! runs as short-lived invocations; durable state lives in the tracker and
//! the document store, never in this struct.

use crate::cleanup;
use crate::config::PipelineConfig;
use crate::correlate::EvidenceCorrelator;
use crate::error::{AnamnesisError, Result};
use crate::promote::PromotionEngine;
use crate::report;
use crate::score;
use crate::store::DocumentStore;
use crate::tracker::WorkflowTracker;
use crate::transition;
use crate::types::{
    DerivedLearning, LearningCandidate, TestOutcome, Workflow, WorkflowId, WorkflowState,
};
use crate::vcs::VcsInspector;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// What happened to an ingested report
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// A new workflow was opened with this report as its baseline
    Opened(Workflow),
    /// The report became the after-report of an existing workflow
    Attached {
        workflow_id: WorkflowId,
        state: WorkflowState,
    },
}

/// Result of one `process` invocation over all ready workflows
#[derive(Debug, Default)]
pub struct ProcessSummary {
    pub promoted: Vec<WorkflowId>,
    pub rejected: Vec<WorkflowId>,
    pub reconciled: Vec<WorkflowId>,
    /// Per-workflow failures; one bad workflow never aborts the batch
    pub failures: Vec<(WorkflowId, String)>,
}

/// The evidence-based learning validation pipeline
pub struct LearningPipeline {
    config: PipelineConfig,
    tracker: WorkflowTracker,
    correlator: EvidenceCorrelator,
    engine: PromotionEngine,
}

impl LearningPipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn DocumentStore>,
        inspector: Arc<dyn VcsInspector>,
    ) -> Result<Self> {
        let tracker = WorkflowTracker::new(&config)?;
        let correlator = EvidenceCorrelator::new(
            store.clone(),
            inspector,
            config.correlation_window(),
        );
        let engine = PromotionEngine::new(
            store,
            config.promotion_threshold,
            config.store_retry_attempts,
            std::time::Duration::from_millis(config.store_retry_backoff_ms),
        );
        Ok(Self {
            config,
            tracker,
            correlator,
            engine,
        })
    }

    /// Access to the underlying tracker (status queries, tests)
    pub fn tracker(&self) -> &WorkflowTracker {
        &self.tracker
    }

    /// Ingest a raw report: snapshot it and open or advance a workflow
    ///
    /// Routing: an explicit `workflow_id` always attaches; otherwise a
    /// matching open workflow for `commit_ref` attaches; otherwise a new
    /// workflow opens with this report as its baseline.
    pub fn ingest(
        &self,
        report_bytes: &[u8],
        commit_ref: Option<String>,
        workflow_id: Option<WorkflowId>,
    ) -> Result<IngestOutcome> {
        let captured_at = Utc::now();
        // Parse up front so malformed reports never open a workflow
        let outcomes = report::parse_report(report_bytes, captured_at)?;
        info!(outcome_count = outcomes.len(), "Ingested test report");

        let report_ref = self.tracker.store_report_snapshot(report_bytes)?;

        let target = match workflow_id {
            Some(id) => Some(id),
            None => match &commit_ref {
                Some(commit) => self
                    .tracker
                    .find_by_commit(commit)?
                    .map(|w| w.workflow_id),
                None => None,
            },
        };

        match target {
            Some(id) => {
                let state = match self.tracker.attach_after(id, &report_ref) {
                    Ok(state) => state,
                    Err(e) => {
                        // Rejected routing leaves the snapshot unreferenced
                        if let Err(cleanup_err) = self.tracker.discard_report_snapshot(&report_ref)
                        {
                            warn!(
                                report_ref = %report_ref,
                                error = %cleanup_err,
                                "Failed to discard unrouted report snapshot"
                            );
                        }
                        return Err(e);
                    }
                };
                Ok(IngestOutcome::Attached {
                    workflow_id: id,
                    state,
                })
            }
            None => {
                let workflow = self.tracker.open(&report_ref, commit_ref)?;
                Ok(IngestOutcome::Opened(workflow))
            }
        }
    }

    /// Run correlation, scoring and promotion for every ready workflow
    ///
    /// Also reconciles `scored` workflows left behind by a partial promotion.
    /// Failures are collected per workflow, never fatal to the batch.
    pub async fn process_ready(&self) -> Result<ProcessSummary> {
        let mut summary = ProcessSummary::default();

        for workflow in self.tracker.list_in_state(WorkflowState::ReadyForCorrelation)? {
            let id = workflow.workflow_id;
            match self.process_one(&workflow).await {
                Ok(Some(_)) => summary.promoted.push(id),
                Ok(None) => summary.rejected.push(id),
                Err(e) => {
                    warn!(workflow_id = %id, error = %e, "Workflow processing failed");
                    summary.failures.push((id, e.to_string()));
                }
            }
        }

        for workflow in self.tracker.list_in_state(WorkflowState::Scored)? {
            let id = workflow.workflow_id;
            match self.engine.reconcile(&self.tracker, &workflow).await {
                Ok(Some(_)) => {
                    summary.reconciled.push(id);
                    if let Err(e) = cleanup::cleanup(&self.tracker, id) {
                        summary.failures.push((id, e.to_string()));
                    }
                }
                // No orphaned learning: the learning write itself never
                // landed, so retry promotion from the snapshots
                Ok(None) => match self.resume_scored(&workflow).await {
                    Ok(Some(_)) => summary.promoted.push(id),
                    Ok(None) => summary.rejected.push(id),
                    Err(e) => {
                        warn!(workflow_id = %id, error = %e, "Scored workflow retry failed");
                        summary.failures.push((id, e.to_string()));
                    }
                },
                Err(e) => {
                    warn!(workflow_id = %id, error = %e, "Reconciliation failed");
                    summary.failures.push((id, e.to_string()));
                }
            }
        }

        Ok(summary)
    }

    /// Process a single ready workflow through to promotion or rejection
    async fn process_one(&self, workflow: &Workflow) -> Result<Option<DerivedLearning>> {
        let id = workflow.workflow_id;
        let candidate = match self.build_candidate(workflow).await {
            Ok(candidate) => candidate,
            Err(AnamnesisError::CorrelationInconclusive { .. }) => {
                warn!(workflow_id = %id, "No code evidence; rejecting workflow");
                self.tracker.advance(id, WorkflowState::Rejected, |_| {})?;
                cleanup::cleanup(&self.tracker, id)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        self.tracker.advance(id, WorkflowState::Correlated, |_| {})?;
        let workflow = self.tracker.advance(id, WorkflowState::Scored, |_| {})?;
        info!(workflow_id = %id, score = candidate.score, "Workflow scored");

        let learning = self.engine.promote(&self.tracker, &workflow, &candidate).await?;
        cleanup::cleanup(&self.tracker, id)?;
        Ok(learning)
    }

    /// Retry a `scored` workflow whose learning write never landed
    ///
    /// The report snapshots are still on disk, so the candidate is rebuilt
    /// and promotion attempted again instead of stranding the workflow until
    /// the expiry sweep.
    async fn resume_scored(&self, workflow: &Workflow) -> Result<Option<DerivedLearning>> {
        let id = workflow.workflow_id;
        let candidate = match self.build_candidate(workflow).await {
            Ok(candidate) => candidate,
            Err(AnamnesisError::CorrelationInconclusive { .. }) => {
                warn!(workflow_id = %id, "No code evidence on retry; rejecting workflow");
                self.tracker.advance(id, WorkflowState::Rejected, |_| {})?;
                cleanup::cleanup(&self.tracker, id)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        info!(workflow_id = %id, score = candidate.score, "Retrying promotion for scored workflow");
        let learning = self.engine.promote(&self.tracker, workflow, &candidate).await?;
        cleanup::cleanup(&self.tracker, id)?;
        Ok(learning)
    }

    /// Load snapshots, detect transitions and correlate into a candidate
    async fn build_candidate(&self, workflow: &Workflow) -> Result<LearningCandidate> {
        let id = workflow.workflow_id;
        let (before, after) = self.load_outcomes(workflow)?;

        let after_ref = workflow
            .after_report_ref
            .as_deref()
            .ok_or_else(|| AnamnesisError::WorkflowNotFound(id.to_string()))?;
        let transitions =
            transition::detect(&before, &after, &workflow.before_report_ref, after_ref);

        // The snapshot timestamps bound the chat correlation window
        let correlation = self
            .correlator
            .correlate(
                workflow,
                &transitions,
                &before,
                workflow.created_at,
                workflow.updated_at,
            )
            .await?;

        let mut evidence = correlation.evidence;
        let chat = correlation.chats.first();
        if let (Some(chat), Some(first)) = (chat, evidence.first_mut()) {
            // Denormalize the best chat summary into the evidence details so
            // the learning text can be built without another store read
            first.details.insert(
                "chat_summary".to_string(),
                json!(format!("{} / {}", chat.prompt_summary, chat.response_summary)),
            );
        }

        Ok(LearningCandidate {
            workflow_id: id,
            score: score::score(&evidence),
            evidence,
            chat_id: chat.map(|c| c.chat_id.clone()),
            code_ref: Some(correlation.code_ref),
        })
    }

    /// Expire idle workflows and clean up their artifacts
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowId>> {
        let expired = self.tracker.sweep_expired(now, self.config.expiry())?;
        for id in &expired {
            cleanup::cleanup(&self.tracker, *id)?;
        }
        Ok(expired)
    }

    /// Parse both report snapshots for a workflow
    fn load_outcomes(&self, workflow: &Workflow) -> Result<(Vec<TestOutcome>, Vec<TestOutcome>)> {
        let before_bytes = self
            .tracker
            .read_report_snapshot(&workflow.before_report_ref)?;
        let after_ref = workflow.after_report_ref.as_deref().ok_or_else(|| {
            AnamnesisError::Other(format!(
                "Workflow {} is ready but has no after-report",
                workflow.workflow_id
            ))
        })?;
        let after_bytes = self.tracker.read_report_snapshot(after_ref)?;

        let before = report::parse_report(&before_bytes, workflow.created_at)?;
        let after = report::parse_report(&after_bytes, workflow.updated_at)?;
        Ok((before, after))
    }
}
