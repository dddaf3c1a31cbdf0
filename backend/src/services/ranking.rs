//! Candidate ordering for a single slot.
//!
//! Distance-eligible candidates come first, then higher fairness score, then
//! lower instructor id. The order is total, so identical inputs always rank
//! identically regardless of the order they arrive in.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::models::InstructorId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub instructor_id: InstructorId,
    pub eligible: bool,
    pub score: i64,
    /// `None` when the distance could not be determined this run.
    pub distance_meters: Option<u64>,
}

fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    b.eligible
        .cmp(&a.eligible)
        .then_with(|| b.score.cmp(&a.score))
        .then_with(|| a.instructor_id.cmp(&b.instructor_id))
}

/// Order candidates for a slot.
pub fn rank_candidates(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(compare);
    candidates
}
