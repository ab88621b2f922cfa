//! Artifact cleanup
//!
//! Once a workflow is terminal (promoted, rejected or expired), its transient
//! artifacts — raw report snapshots and the persisted state record — are
//! removed to bound storage growth. Cleanup on a workflow in any other state
//! is a warning no-op: retried automation may invoke it twice, and an open
//! workflow must never lose its artifacts.

use crate::error::{AnamnesisError, Result};
use crate::tracker::WorkflowTracker;
use crate::types::WorkflowId;
use tracing::{info, warn};

/// Remove a terminal workflow's transient artifacts
///
/// Returns `true` when artifacts were removed, `false` for the no-op cases
/// (non-terminal workflow, or record already gone).
pub fn cleanup(tracker: &WorkflowTracker, workflow_id: WorkflowId) -> Result<bool> {
    let workflow = match tracker.get(workflow_id) {
        Ok(workflow) => workflow,
        Err(AnamnesisError::WorkflowNotFound(_)) => {
            // Double-invocation after a successful cleanup
            warn!(workflow_id = %workflow_id, "Cleanup requested for missing workflow; no-op");
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    if !workflow.state.is_terminal() {
        warn!(
            workflow_id = %workflow_id,
            state = %workflow.state,
            "Cleanup requested for non-terminal workflow; no-op"
        );
        return Ok(false);
    }

    tracker.remove_artifacts(&workflow)?;
    info!(
        workflow_id = %workflow_id,
        state = %workflow.state,
        "Removed workflow artifacts"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::types::WorkflowState;
    use tempfile::TempDir;

    fn test_tracker(dir: &TempDir) -> WorkflowTracker {
        let config = PipelineConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        WorkflowTracker::new(&config).unwrap()
    }

    #[test]
    fn test_cleanup_noop_on_open_workflow() {
        let dir = TempDir::new().unwrap();
        let tracker = test_tracker(&dir);

        let report_ref = tracker.store_report_snapshot(b"<testsuite/>").unwrap();
        let wf = tracker.open(&report_ref, None).unwrap();

        let removed = cleanup(&tracker, wf.workflow_id).unwrap();
        assert!(!removed);
        // The workflow record must still exist afterward
        assert!(tracker.exists(wf.workflow_id));
        assert!(tracker.read_report_snapshot(&report_ref).is_ok());
    }

    #[test]
    fn test_cleanup_removes_terminal_workflow_artifacts() {
        let dir = TempDir::new().unwrap();
        let tracker = test_tracker(&dir);

        let before_ref = tracker.store_report_snapshot(b"<testsuite/>").unwrap();
        let after_ref = tracker.store_report_snapshot(b"<testsuite/>").unwrap();
        let wf = tracker.open(&before_ref, None).unwrap();
        tracker.attach_after(wf.workflow_id, &after_ref).unwrap();
        tracker
            .advance(wf.workflow_id, WorkflowState::Rejected, |_| {})
            .unwrap();

        let removed = cleanup(&tracker, wf.workflow_id).unwrap();
        assert!(removed);
        assert!(!tracker.exists(wf.workflow_id));
        assert!(tracker.read_report_snapshot(&before_ref).is_err());
        assert!(tracker.read_report_snapshot(&after_ref).is_err());
    }

    #[test]
    fn test_cleanup_twice_is_safe() {
        let dir = TempDir::new().unwrap();
        let tracker = test_tracker(&dir);

        let before_ref = tracker.store_report_snapshot(b"<testsuite/>").unwrap();
        let wf = tracker.open(&before_ref, None).unwrap();
        tracker
            .advance(wf.workflow_id, WorkflowState::Expired, |_| {})
            .unwrap();

        assert!(cleanup(&tracker, wf.workflow_id).unwrap());
        assert!(!cleanup(&tracker, wf.workflow_id).unwrap());
    }

    #[test]
    fn test_cleanup_expired_workflow() {
        let dir = TempDir::new().unwrap();
        let tracker = test_tracker(&dir);

        let wf = tracker.open("missing-snapshot", None).unwrap();
        tracker
            .advance(wf.workflow_id, WorkflowState::Expired, |_| {})
            .unwrap();

        // Missing snapshots are tolerated; the record still goes away
        assert!(cleanup(&tracker, wf.workflow_id).unwrap());
        assert!(!tracker.exists(wf.workflow_id));
    }
}
