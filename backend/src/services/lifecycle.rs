//! Assignment state machine.
//!
//! ```text
//!            accept
//! Pending ─────────▶ Accepted ──┐
//!    │  reject                  │ cancel
//!    ├─────────▶ Rejected       ▼
//!    └──────────────────────▶ Canceled
//!            cancel
//! ```
//!
//! Decisions are only accepted from `Pending`. Administrative cancel is also
//! allowed from `Accepted`, which frees the slot for a later run. `Rejected`
//! and `Canceled` are terminal. Every write is a compare-and-set on the
//! current state, so two racing callers cannot both win.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::db::repository::{AssignmentRepository, CasOutcome, FullRepository};
use crate::error::{EngineError, EngineResult};
use crate::models::{Assignment, AssignmentId, AssignmentState, Decision, InstructorId};
use crate::services::fairness::{CreditReason, FairnessLedger, PenaltyReason};

const MAX_CAS_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Decide(Decision),
    Cancel,
}

impl Transition {
    /// State the transition leads to when it is allowed.
    pub fn target(self) -> AssignmentState {
        match self {
            Transition::Decide(Decision::Accept) => AssignmentState::Accepted,
            Transition::Decide(Decision::Reject) => AssignmentState::Rejected,
            Transition::Cancel => AssignmentState::Canceled,
        }
    }
}

/// Pure transition table.
pub fn next_state(current: AssignmentState, transition: Transition) -> Option<AssignmentState> {
    use AssignmentState::*;
    match (current, transition) {
        (Pending, _) => Some(transition.target()),
        (Accepted, Transition::Cancel) => Some(Canceled),
        _ => None,
    }
}

#[derive(Clone)]
pub struct AssignmentLifecycle {
    repo: Arc<dyn FullRepository>,
    ledger: FairnessLedger,
}

impl AssignmentLifecycle {
    pub fn new(repo: Arc<dyn FullRepository>, ledger: FairnessLedger) -> Self {
        Self { repo, ledger }
    }

    /// Apply an instructor's decision to a pending assignment.
    ///
    /// # Returns
    /// * `Ok(Assignment)` - The assignment in its new state
    /// * `Err(EngineError::InvalidTransition)` - Not pending (any more)
    /// * `Err(EngineError::AssignmentNotFound)` - Unknown id
    pub async fn decide(
        &self,
        assignment_id: AssignmentId,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> EngineResult<Assignment> {
        let updated = self
            .apply(assignment_id, Transition::Decide(decision), now)
            .await?;
        if decision == Decision::Reject {
            if let Err(err) = self.penalize_rejections(updated.instructor_id, now).await {
                warn!(%assignment_id, error = %err, "could not update rejection penalty");
            }
        }
        Ok(updated)
    }

    /// Administrative cancel from `Pending` or `Accepted`.
    pub async fn cancel(
        &self,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> EngineResult<Assignment> {
        self.apply(assignment_id, Transition::Cancel, now).await
    }

    /// Credit the instructor for an accepted assignment whose date has passed.
    ///
    /// Completing the same assignment again, concurrently or years later,
    /// records no further credit.
    pub async fn complete(
        &self,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> EngineResult<Assignment> {
        let assignment = self
            .repo
            .get_assignment(assignment_id)
            .await
            .map_err(|e| EngineError::for_assignment(assignment_id, e))?;
        if assignment.state != AssignmentState::Accepted {
            return Err(EngineError::NotCompletable {
                assignment: assignment_id,
                reason: format!("state is {}", assignment.state),
            });
        }
        if assignment.date >= now.date_naive() {
            return Err(EngineError::NotCompletable {
                assignment: assignment_id,
                reason: format!("training on {} has not taken place", assignment.date),
            });
        }

        self.ledger
            .record_credit(
                assignment.instructor_id,
                CreditReason::Completion(assignment_id),
                now,
            )
            .await?;
        Ok(assignment)
    }

    async fn apply(
        &self,
        assignment_id: AssignmentId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> EngineResult<Assignment> {
        let mut current = self
            .repo
            .get_assignment(assignment_id)
            .await
            .map_err(|e| EngineError::for_assignment(assignment_id, e))?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(next) = next_state(current.state, transition) else {
                return Err(EngineError::InvalidTransition {
                    assignment: assignment_id,
                    from: current.state,
                    attempted: transition.target(),
                });
            };
            match self
                .repo
                .compare_and_set_state(assignment_id, current.state, next, now)
                .await
                .map_err(|e| EngineError::for_assignment(assignment_id, e))?
            {
                CasOutcome::Applied(updated) => {
                    info!(%assignment_id, from = %current.state, to = %next, "assignment updated");
                    return Ok(updated);
                }
                CasOutcome::Stale(latest) => current = latest,
            }
        }

        Err(EngineError::InvalidTransition {
            assignment: assignment_id,
            from: current.state,
            attempted: transition.target(),
        })
    }

    /// Penalize once the rejections inside the window reach the threshold.
    async fn penalize_rejections(
        &self,
        instructor_id: InstructorId,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let since = self.ledger.window_start(now);
        let rejections = self
            .repo
            .list_assignments_for_instructor(instructor_id)
            .await?
            .iter()
            .filter(|a| a.state == AssignmentState::Rejected)
            .filter(|a| a.decided_at.map(|t| t >= since).unwrap_or(false))
            .count();
        if rejections as u64 >= u64::from(self.ledger.settings().rejection_threshold) {
            self.ledger
                .record_penalty(instructor_id, PenaltyReason::ExcessiveRejection, now)
                .await?;
        }
        Ok(())
    }
}
