//! Workflow state tracker
//!
//! Persists one JSON record per workflow plus raw report snapshots under the
//! pipeline data directory, so a correlation that spans several process
//! invocations ("run tests, apply a fix, run tests again") never loses state.
//! Every mutation acquires a per-workflow advisory file lock with a bounded
//! wait; a process that cannot get the lock aborts that invocation cleanly
//! and retries on the next trigger.
//!
//! Invocations are short-lived CLI runs, so record I/O is synchronous; the
//! records are small JSON documents.

use crate::config::PipelineConfig;
use crate::error::{AnamnesisError, Result};
use crate::types::{Workflow, WorkflowId, WorkflowState};
use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Poll interval while waiting for an advisory lock
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// File-backed workflow tracker
pub struct WorkflowTracker {
    workflows_dir: PathBuf,
    reports_dir: PathBuf,
    lock_timeout: Duration,
}

impl WorkflowTracker {
    /// Create a tracker rooted at the configured data directory
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let workflows_dir = config.workflows_dir();
        let reports_dir = config.reports_dir();
        fs::create_dir_all(&workflows_dir)?;
        fs::create_dir_all(&reports_dir)?;

        Ok(Self {
            workflows_dir,
            reports_dir,
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
        })
    }

    fn record_path(&self, id: WorkflowId) -> PathBuf {
        self.workflows_dir.join(format!("{}.json", id))
    }

    fn lock_path(&self, id: WorkflowId) -> PathBuf {
        self.workflows_dir.join(format!("{}.lock", id))
    }

    fn report_path(&self, report_ref: &str) -> PathBuf {
        self.reports_dir.join(format!("{}.xml", report_ref))
    }

    /// Run `f` while holding the per-workflow advisory lock
    ///
    /// Waits up to the configured timeout for the lock; on timeout the
    /// invocation aborts with [`AnamnesisError::LockTimeout`] so the caller
    /// can retry on its next trigger instead of blocking.
    fn with_lock<T, F>(&self, id: WorkflowId, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path(id))?;
        let mut lock = RwLock::new(file);

        let deadline = Instant::now() + self.lock_timeout;
        let guard = loop {
            match lock.try_write() {
                Ok(guard) => break guard,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        warn!(workflow_id = %id, "Advisory lock acquisition timed out");
                        return Err(AnamnesisError::LockTimeout(id.to_string()));
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        };

        let result = f(self);
        drop(guard);
        result
    }

    fn write_record(&self, workflow: &Workflow) -> Result<()> {
        let json = serde_json::to_string_pretty(workflow)?;
        fs::write(self.record_path(workflow.workflow_id), json)?;
        Ok(())
    }

    fn read_record(&self, id: WorkflowId) -> Result<Workflow> {
        let path = self.record_path(id);
        let json = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AnamnesisError::WorkflowNotFound(id.to_string())
            } else {
                AnamnesisError::Io(e)
            }
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Open a new workflow for an ingested before-report
    pub fn open(&self, before_report_ref: &str, commit_ref: Option<String>) -> Result<Workflow> {
        let workflow = Workflow::open(before_report_ref.to_string(), commit_ref);
        self.write_record(&workflow)?;
        info!(
            workflow_id = %workflow.workflow_id,
            before_report_ref,
            "Opened workflow"
        );
        Ok(workflow)
    }

    /// Fetch a workflow record by ID
    pub fn get(&self, id: WorkflowId) -> Result<Workflow> {
        self.read_record(id)
    }

    /// Find the most recent open workflow recorded against a commit
    ///
    /// Later invocations often know only the commit, not the workflow ID.
    pub fn find_by_commit(&self, commit_ref: &str) -> Result<Option<Workflow>> {
        let mut best: Option<Workflow> = None;
        for workflow in self.list()? {
            if workflow.state.is_terminal() {
                continue;
            }
            if workflow.commit_ref.as_deref() == Some(commit_ref) {
                let newer = best
                    .as_ref()
                    .map(|b| workflow.created_at > b.created_at)
                    .unwrap_or(true);
                if newer {
                    best = Some(workflow);
                }
            }
        }
        Ok(best)
    }

    /// List all persisted workflow records
    pub fn list(&self) -> Result<Vec<Workflow>> {
        let mut workflows = Vec::new();
        for entry in fs::read_dir(&self.workflows_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(uuid) = Uuid::parse_str(stem) else {
                debug!(?path, "Skipping non-workflow file in workflows dir");
                continue;
            };
            workflows.push(self.read_record(WorkflowId(uuid))?);
        }
        workflows.sort_by_key(|w| w.created_at);
        Ok(workflows)
    }

    /// List workflows currently in a given state
    pub fn list_in_state(&self, state: WorkflowState) -> Result<Vec<Workflow>> {
        Ok(self.list()?.into_iter().filter(|w| w.state == state).collect())
    }

    /// Attach the after-report to a pending workflow
    ///
    /// Idempotent: attaching the same ref twice is a no-op. Attaching a
    /// *different* ref to a workflow already in `ready_for_correlation`
    /// replaces the pending one with a warning (latest wins: the developer
    /// re-ran tests before the pipeline processed the first result).
    pub fn attach_after(&self, id: WorkflowId, after_report_ref: &str) -> Result<WorkflowState> {
        self.with_lock(id, |tracker| {
            tracker.attach_after_locked(id, after_report_ref)
        })
    }

    fn attach_after_locked(&self, id: WorkflowId, after_report_ref: &str) -> Result<WorkflowState> {
        let mut workflow = self.read_record(id)?;

        match workflow.state {
            WorkflowState::PendingAfter => {
                workflow.after_report_ref = Some(after_report_ref.to_string());
                workflow.state = WorkflowState::ReadyForCorrelation;
                workflow.updated_at = Utc::now();
                self.write_record(&workflow)?;
                info!(
                    workflow_id = %id,
                    after_report_ref,
                    "Attached after-report; workflow ready for correlation"
                );
            }
            WorkflowState::ReadyForCorrelation => {
                if workflow.after_report_ref.as_deref() == Some(after_report_ref) {
                    debug!(workflow_id = %id, "attach_after repeated with same ref; no-op");
                } else {
                    warn!(
                        workflow_id = %id,
                        previous = ?workflow.after_report_ref,
                        replacement = after_report_ref,
                        "Replacing pending after-report; latest wins"
                    );
                    // The replaced snapshot is unreferenced from here on
                    if let Some(previous) = workflow.after_report_ref.take() {
                        self.discard_report_snapshot(&previous)?;
                    }
                    workflow.after_report_ref = Some(after_report_ref.to_string());
                    workflow.updated_at = Utc::now();
                    self.write_record(&workflow)?;
                }
            }
            state => {
                warn!(
                    workflow_id = %id,
                    %state,
                    "attach_after rejected: workflow already past correlation"
                );
                return Err(AnamnesisError::InvalidTransition {
                    from: state.to_string(),
                    to: WorkflowState::ReadyForCorrelation.to_string(),
                });
            }
        }

        Ok(workflow.state)
    }

    /// Advance a workflow to `next`, applying `mutate` under the lock
    ///
    /// Rejects (and logs) any move the state machine forbids, including every
    /// mutation of a terminal record.
    pub fn advance<F>(&self, id: WorkflowId, next: WorkflowState, mutate: F) -> Result<Workflow>
    where
        F: FnOnce(&mut Workflow),
    {
        self.with_lock(id, |tracker| tracker.advance_locked(id, next, mutate))
    }

    fn advance_locked<F>(&self, id: WorkflowId, next: WorkflowState, mutate: F) -> Result<Workflow>
    where
        F: FnOnce(&mut Workflow),
    {
        let mut workflow = self.read_record(id)?;

        if !workflow.state.can_advance_to(next) {
            warn!(
                workflow_id = %id,
                from = %workflow.state,
                to = %next,
                "Rejected invalid workflow transition"
            );
            return Err(AnamnesisError::InvalidTransition {
                from: workflow.state.to_string(),
                to: next.to_string(),
            });
        }

        mutate(&mut workflow);
        workflow.state = next;
        workflow.updated_at = Utc::now();
        self.write_record(&workflow)?;
        debug!(workflow_id = %id, state = %next, "Workflow advanced");
        Ok(workflow)
    }

    /// Expire every non-terminal workflow that has been idle past the timeout
    ///
    /// Expiry is a plain time comparison, so an interrupted sweep can safely
    /// be re-run.
    pub fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        expiry: chrono::Duration,
    ) -> Result<Vec<WorkflowId>> {
        let mut expired = Vec::new();
        for workflow in self.list()? {
            if workflow.state.is_terminal() {
                continue;
            }
            if now - workflow.updated_at >= expiry {
                let id = workflow.workflow_id;
                match self.advance(id, WorkflowState::Expired, |_| {}) {
                    Ok(_) => {
                        info!(workflow_id = %id, "Workflow expired");
                        expired.push(id);
                    }
                    // A concurrent invocation finished it first; nothing to do
                    Err(AnamnesisError::InvalidTransition { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(expired)
    }

    /// Persist a raw report snapshot, returning its report ref
    pub fn store_report_snapshot(&self, bytes: &[u8]) -> Result<String> {
        let report_ref = Uuid::new_v4().to_string();
        fs::write(self.report_path(&report_ref), bytes)?;
        Ok(report_ref)
    }

    /// Read back a raw report snapshot by ref
    pub fn read_report_snapshot(&self, report_ref: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.report_path(report_ref))?)
    }

    /// Delete a report snapshot no workflow references anymore
    pub(crate) fn discard_report_snapshot(&self, report_ref: &str) -> Result<()> {
        let path = self.report_path(report_ref);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Remove a workflow's transient artifacts: report snapshots, record,
    /// and lock file
    ///
    /// Callers must gate on terminal state (see the cleanup module); this is
    /// the raw removal primitive.
    pub(crate) fn remove_artifacts(&self, workflow: &Workflow) -> Result<()> {
        let mut snapshots = vec![workflow.before_report_ref.clone()];
        if let Some(after) = &workflow.after_report_ref {
            snapshots.push(after.clone());
        }
        for report_ref in snapshots {
            self.discard_report_snapshot(&report_ref)?;
        }
        let record = self.record_path(workflow.workflow_id);
        if record.exists() {
            fs::remove_file(record)?;
        }
        let lock = self.lock_path(workflow.workflow_id);
        if lock.exists() {
            fs::remove_file(lock)?;
        }
        Ok(())
    }

    /// Whether the workflow record still exists on disk
    pub fn exists(&self, id: WorkflowId) -> bool {
        self.record_path(id).exists()
    }
}
