//! Validation scorer
//!
//! Converts gathered evidence into a single confidence score with fixed
//! per-category weights. The same evidence type is counted once per workflow
//! (at its maximum observed weight), which prevents gaming the score by
//! generating many small transitions for one underlying fix.

use crate::types::{EvidenceType, ValidationEvidence};
use std::collections::HashMap;

/// Fixed weight for a test transition (fail|error -> pass)
pub const TEST_TRANSITION_WEIGHT: f64 = 0.5;
/// Fixed weight for a measured quality-metric improvement
pub const QUALITY_IMPROVEMENT_WEIGHT: f64 = 0.3;
/// Fixed weight for a resolved runtime exception
pub const ERROR_RESOLUTION_WEIGHT: f64 = 0.3;
/// Fixed weight for a corrected knowledge gap
pub const KNOWLEDGE_GAP_WEIGHT: f64 = 0.2;

/// Canonical weight for an evidence category
pub fn weight_for(evidence_type: EvidenceType) -> f64 {
    match evidence_type {
        EvidenceType::TestTransition => TEST_TRANSITION_WEIGHT,
        EvidenceType::QualityImprovement => QUALITY_IMPROVEMENT_WEIGHT,
        EvidenceType::ErrorResolution => ERROR_RESOLUTION_WEIGHT,
        EvidenceType::KnowledgeGap => KNOWLEDGE_GAP_WEIGHT,
    }
}

/// Compute the validation score for one workflow's evidence
///
/// `score = min(1.0, sum(max weight per evidence type))`. Quality and
/// knowledge-gap evidence exist so candidates with no test transition at all
/// (pure refactors with measured complexity reduction) can still clear the
/// threshold.
pub fn score(evidence: &[ValidationEvidence]) -> f64 {
    let mut max_by_type: HashMap<EvidenceType, f64> = HashMap::new();
    for item in evidence {
        let entry = max_by_type.entry(item.evidence_type).or_insert(0.0);
        if item.weight > *entry {
            *entry = item.weight;
        }
    }
    max_by_type.values().sum::<f64>().min(1.0)
}
