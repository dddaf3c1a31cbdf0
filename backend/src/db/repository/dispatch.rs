//! Dispatch repository: notification runs and their delivery tasks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::RepositoryResult;
use crate::models::{AssignmentId, Dispatch, DispatchAssignment, DispatchId};

/// Result of [`DispatchRepository::create_dispatch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchCreation {
    /// `None` when every requested assignment was skipped.
    pub dispatch: Option<Dispatch>,
    /// Assignments that are no longer `Pending` or already hold a live
    /// delivery, in request order.
    pub skipped: Vec<AssignmentId>,
}

#[async_trait]
pub trait DispatchRepository: Send + Sync {
    /// Create a dispatch run with one `Scheduled` task per assignment that is
    /// still `Pending` and has no live delivery.
    ///
    /// The skip decision and the insert happen in one write, so overlapping
    /// calls for the same assignment create at most one live task.
    ///
    /// # Returns
    /// * `Err(RepositoryError::NotFound)` - An assignment does not exist; nothing is created
    async fn create_dispatch(
        &self,
        assignment_ids: &[AssignmentId],
        created_at: DateTime<Utc>,
    ) -> RepositoryResult<DispatchCreation>;

    /// Delivery tasks of a dispatch in assignment order.
    async fn list_deliveries(
        &self,
        dispatch_id: DispatchId,
    ) -> RepositoryResult<Vec<DispatchAssignment>>;

    /// The most recent delivery task for an assignment across all dispatches.
    async fn find_delivery(
        &self,
        assignment_id: AssignmentId,
    ) -> RepositoryResult<Option<DispatchAssignment>>;

    /// Claim a task for one transport attempt.
    ///
    /// Succeeds only if the stored task still has the status, attempt count
    /// and attempt start of `expected`. The claimed task is `InFlight`, has
    /// `attempts` incremented and `attempt_started_at = started_at`.
    ///
    /// # Returns
    /// * `Ok(Some(task))` - This caller owns the attempt
    /// * `Ok(None)` - Another caller got there first; do not send
    async fn claim_delivery(
        &self,
        expected: &DispatchAssignment,
        started_at: DateTime<Utc>,
    ) -> RepositoryResult<Option<DispatchAssignment>>;

    /// Overwrite a delivery task identified by (dispatch, assignment).
    async fn update_delivery(&self, delivery: &DispatchAssignment) -> RepositoryResult<()>;

    /// Tasks a retry pass at `now` should pick up; see
    /// [`DispatchAssignment::is_due`].
    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        orphan_after: chrono::Duration,
    ) -> RepositoryResult<Vec<DispatchAssignment>>;

    /// `Sent` tasks delivered at or before `cutoff` that have not been penalized.
    async fn list_unanswered(
        &self,
        cutoff: DateTime<Utc>,
    ) -> RepositoryResult<Vec<DispatchAssignment>>;

    /// Set the `penalized` flag of a `Sent` task.
    ///
    /// # Returns
    /// `true` if this call set the flag, `false` if it was already set.
    async fn mark_penalized(
        &self,
        dispatch_id: DispatchId,
        assignment_id: AssignmentId,
    ) -> RepositoryResult<bool>;
}
