//! Assignment repository: atomic reservation batches and guarded transitions.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::error::RepositoryResult;
use crate::models::{Assignment, AssignmentId, AssignmentState, InstructorId, NewAssignment};

/// Outcome of a compare-and-set state write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The stored state matched the expectation and was replaced.
    Applied(Assignment),
    /// The stored state had already moved on; nothing was written.
    Stale(Assignment),
}

#[async_trait]
pub trait AssignmentRepository: Send + Sync {
    /// Persist a reservation batch all-or-nothing.
    ///
    /// The whole batch is validated against the stored state before anything
    /// is written. The storage rejects the batch if any entry would give an
    /// instructor two active assignments on the same date, or push a
    /// (unit, date) past the headcount of that unit's training locations.
    ///
    /// # Returns
    /// * `Ok(Vec<Assignment>)` - The created assignments in batch order, all `Pending`
    /// * `Err(RepositoryError::Conflict)` - An invariant would break; nothing applied
    /// * `Err(RepositoryError::Aborted)` - The commit failed; nothing applied
    async fn commit_assignments(
        &self,
        batch: &[NewAssignment],
        created_at: DateTime<Utc>,
    ) -> RepositoryResult<Vec<Assignment>>;

    async fn get_assignment(&self, assignment_id: AssignmentId) -> RepositoryResult<Assignment>;

    /// Every assignment ordered by id.
    async fn list_assignments(&self) -> RepositoryResult<Vec<Assignment>>;

    /// Active (`Pending`/`Accepted`) assignments on `date`, any unit.
    async fn list_active_assignments_on(&self, date: NaiveDate)
        -> RepositoryResult<Vec<Assignment>>;

    async fn list_assignments_for_instructor(
        &self,
        instructor_id: InstructorId,
    ) -> RepositoryResult<Vec<Assignment>>;

    /// Atomically replace the state of an assignment if it still equals
    /// `expected`. `decided_at` is stamped on success.
    async fn compare_and_set_state(
        &self,
        assignment_id: AssignmentId,
        expected: AssignmentState,
        next: AssignmentState,
        decided_at: DateTime<Utc>,
    ) -> RepositoryResult<CasOutcome>;

    /// Administrative reset: drop every assignment and delivery task.
    ///
    /// # Returns
    /// Number of assignments removed.
    async fn clear_assignments(&self) -> RepositoryResult<usize>;
}
