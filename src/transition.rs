//! Transition detector
//!
//! Compares two test outcome snapshots and emits a [`TestTransition`] for
//! every test whose status changed. Pairing is strictly by `test_id`:
//! tests present in only one snapshot never produce a transition. Results
//! are ordered by ascending `test_id` so fixtures are reproducible.

use crate::types::{TestOutcome, TestTransition};
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::debug;

/// Detect status transitions between a before and an after snapshot
///
/// Tests present only in `after` are new and have no baseline; tests present
/// only in `before` were removed and never generate transitions. Both cases
/// are logged as informational and excluded from the result.
pub fn detect(
    before: &[TestOutcome],
    after: &[TestOutcome],
    before_report_ref: &str,
    after_report_ref: &str,
) -> Vec<TestTransition> {
    // BTreeMap gives deterministic ascending test_id ordering for free.
    // Later duplicates overwrite earlier ones, matching the ingestor's
    // last-seen-wins rule.
    let before_by_id: BTreeMap<&str, &TestOutcome> = before
        .iter()
        .map(|o| (o.test_id.as_str(), o))
        .collect();
    let after_by_id: BTreeMap<&str, &TestOutcome> = after
        .iter()
        .map(|o| (o.test_id.as_str(), o))
        .collect();

    let detected_at = Utc::now();
    let mut transitions = Vec::new();

    for (test_id, before_outcome) in &before_by_id {
        match after_by_id.get(test_id) {
            Some(after_outcome) => {
                if before_outcome.status != after_outcome.status {
                    transitions.push(TestTransition {
                        test_id: (*test_id).to_string(),
                        before_status: before_outcome.status,
                        after_status: after_outcome.status,
                        before_report_ref: before_report_ref.to_string(),
                        after_report_ref: after_report_ref.to_string(),
                        detected_at,
                    });
                }
            }
            None => {
                debug!(test_id, "Test removed between reports; no transition");
            }
        }
    }

    for test_id in after_by_id.keys() {
        if !before_by_id.contains_key(test_id) {
            debug!(test_id, "New test with no baseline; no transition");
        }
    }

    transitions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TestStatus, TransitionKind};
    use chrono::Utc;

    fn outcome(test_id: &str, status: TestStatus) -> TestOutcome {
        TestOutcome {
            test_id: test_id.to_string(),
            status,
            duration_ms: 1,
            failure_message: None,
            report_timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_detect_fail_to_pass() {
        let before = vec![outcome("test_x", TestStatus::Fail)];
        let after = vec![outcome("test_x", TestStatus::Pass)];

        let transitions = detect(&before, &after, "r1", "r2");
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].test_id, "test_x");
        assert_eq!(transitions[0].kind(), TransitionKind::Fixed);
        assert_eq!(transitions[0].before_report_ref, "r1");
        assert_eq!(transitions[0].after_report_ref, "r2");
    }

    #[test]
    fn test_no_transition_for_unchanged_status() {
        let before = vec![
            outcome("a", TestStatus::Pass),
            outcome("b", TestStatus::Fail),
        ];
        let after = vec![
            outcome("a", TestStatus::Pass),
            outcome("b", TestStatus::Fail),
        ];
        assert!(detect(&before, &after, "r1", "r2").is_empty());
    }

    #[test]
    fn test_new_test_produces_no_transition() {
        let before = vec![outcome("old", TestStatus::Pass)];
        let after = vec![
            outcome("old", TestStatus::Pass),
            outcome("brand_new", TestStatus::Fail),
        ];
        assert!(detect(&before, &after, "r1", "r2").is_empty());
    }

    #[test]
    fn test_removed_test_produces_no_transition() {
        let before = vec![
            outcome("kept", TestStatus::Fail),
            outcome("removed", TestStatus::Fail),
        ];
        let after = vec![outcome("kept", TestStatus::Pass)];

        let transitions = detect(&before, &after, "r1", "r2");
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].test_id, "kept");
    }

    #[test]
    fn test_regression_is_recorded() {
        let before = vec![outcome("test_y", TestStatus::Pass)];
        let after = vec![outcome("test_y", TestStatus::Fail)];

        let transitions = detect(&before, &after, "r1", "r2");
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].kind(), TransitionKind::Regressed);
        assert!(!transitions[0].kind().is_promotable());
    }

    #[test]
    fn test_ordering_ascending_by_test_id() {
        let before = vec![
            outcome("zeta", TestStatus::Fail),
            outcome("alpha", TestStatus::Fail),
            outcome("mid", TestStatus::Fail),
        ];
        let after = vec![
            outcome("mid", TestStatus::Pass),
            outcome("zeta", TestStatus::Pass),
            outcome("alpha", TestStatus::Pass),
        ];

        let ids: Vec<_> = detect(&before, &after, "r1", "r2")
            .into_iter()
            .map(|t| t.test_id)
            .collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_count_bounded_by_smaller_set() {
        let before = vec![
            outcome("a", TestStatus::Fail),
            outcome("b", TestStatus::Fail),
            outcome("c", TestStatus::Fail),
        ];
        let after = vec![outcome("a", TestStatus::Pass)];

        let transitions = detect(&before, &after, "r1", "r2");
        assert!(transitions.len() <= before.len().min(after.len()));
    }
}
