//! A repository double that suspends around every call, as a networked store
//! would, so that concurrently polled engine calls interleave between reads
//! and writes. Chosen writes can be made to fail.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use instructor_dispatch::db::repositories::LocalRepository;
use instructor_dispatch::db::repository::{
    AssignmentRepository, CasOutcome, DispatchCreation, DispatchRepository, LedgerRepository,
    RepositoryError, RepositoryResult, RosterRepository,
};
use instructor_dispatch::models::*;

macro_rules! yielding {
    ($self:ident . $method:ident ( $($arg:expr),* )) => {{
        tokio::task::yield_now().await;
        let result = $self.inner.$method($($arg),*).await;
        tokio::task::yield_now().await;
        result
    }};
}

#[derive(Clone, Default)]
pub struct YieldingRepository {
    pub inner: LocalRepository,
    failing_outcome_writes: Arc<AtomicUsize>,
    failing_ledger_writes: Arc<AtomicUsize>,
}

impl YieldingRepository {
    pub fn over(inner: LocalRepository) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    /// Fail the next `times` writes that record how a delivery attempt ended.
    pub fn fail_outcome_writes(&self, times: usize) {
        self.failing_outcome_writes.store(times, Ordering::SeqCst);
    }

    /// Fail the next `times` ledger appends.
    pub fn fail_ledger_writes(&self, times: usize) {
        self.failing_ledger_writes.store(times, Ordering::SeqCst);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RosterRepository for YieldingRepository {
    async fn health_check(&self) -> RepositoryResult<bool> {
        yielding!(self.health_check())
    }

    async fn store_unit(&self, unit: &Unit) -> RepositoryResult<Unit> {
        yielding!(self.store_unit(unit))
    }

    async fn get_unit(&self, unit_id: UnitId) -> RepositoryResult<Unit> {
        yielding!(self.get_unit(unit_id))
    }

    async fn list_units(&self) -> RepositoryResult<Vec<Unit>> {
        yielding!(self.list_units())
    }

    async fn list_schedules(&self, unit_id: UnitId) -> RepositoryResult<Vec<UnitSchedule>> {
        yielding!(self.list_schedules(unit_id))
    }

    async fn store_location(
        &self,
        location: &TrainingLocation,
    ) -> RepositoryResult<TrainingLocation> {
        yielding!(self.store_location(location))
    }

    async fn list_locations(&self, unit_id: UnitId) -> RepositoryResult<Vec<TrainingLocation>> {
        yielding!(self.list_locations(unit_id))
    }

    async fn store_instructor(&self, instructor: &Instructor) -> RepositoryResult<Instructor> {
        yielding!(self.store_instructor(instructor))
    }

    async fn get_instructor(&self, instructor_id: InstructorId) -> RepositoryResult<Instructor> {
        yielding!(self.get_instructor(instructor_id))
    }

    async fn list_instructors(&self) -> RepositoryResult<Vec<Instructor>> {
        yielding!(self.list_instructors())
    }

    async fn declare_availability(
        &self,
        instructor_id: InstructorId,
        date: NaiveDate,
    ) -> RepositoryResult<bool> {
        yielding!(self.declare_availability(instructor_id, date))
    }

    async fn list_available_instructors(
        &self,
        date: NaiveDate,
    ) -> RepositoryResult<Vec<InstructorId>> {
        yielding!(self.list_available_instructors(date))
    }
}

#[async_trait]
impl AssignmentRepository for YieldingRepository {
    async fn commit_assignments(
        &self,
        batch: &[NewAssignment],
        created_at: DateTime<Utc>,
    ) -> RepositoryResult<Vec<Assignment>> {
        yielding!(self.commit_assignments(batch, created_at))
    }

    async fn get_assignment(&self, assignment_id: AssignmentId) -> RepositoryResult<Assignment> {
        yielding!(self.get_assignment(assignment_id))
    }

    async fn list_assignments(&self) -> RepositoryResult<Vec<Assignment>> {
        yielding!(self.list_assignments())
    }

    async fn list_active_assignments_on(
        &self,
        date: NaiveDate,
    ) -> RepositoryResult<Vec<Assignment>> {
        yielding!(self.list_active_assignments_on(date))
    }

    async fn list_assignments_for_instructor(
        &self,
        instructor_id: InstructorId,
    ) -> RepositoryResult<Vec<Assignment>> {
        yielding!(self.list_assignments_for_instructor(instructor_id))
    }

    async fn compare_and_set_state(
        &self,
        assignment_id: AssignmentId,
        expected: AssignmentState,
        next: AssignmentState,
        decided_at: DateTime<Utc>,
    ) -> RepositoryResult<CasOutcome> {
        yielding!(self.compare_and_set_state(assignment_id, expected, next, decided_at))
    }

    async fn clear_assignments(&self) -> RepositoryResult<usize> {
        yielding!(self.clear_assignments())
    }
}

#[async_trait]
impl LedgerRepository for YieldingRepository {
    async fn get_distance(
        &self,
        instructor_id: InstructorId,
        unit_id: UnitId,
    ) -> RepositoryResult<Option<DistanceRecord>> {
        yielding!(self.get_distance(instructor_id, unit_id))
    }

    async fn upsert_distance(&self, record: &DistanceRecord) -> RepositoryResult<()> {
        yielding!(self.upsert_distance(record))
    }

    async fn append_ledger_entry(&self, entry: &LedgerEntry) -> RepositoryResult<()> {
        if Self::take(&self.failing_ledger_writes) {
            return Err(RepositoryError::unavailable("ledger write dropped"));
        }
        yielding!(self.append_ledger_entry(entry))
    }

    async fn append_ledger_entry_once(&self, entry: &LedgerEntry) -> RepositoryResult<bool> {
        if Self::take(&self.failing_ledger_writes) {
            return Err(RepositoryError::unavailable("ledger write dropped"));
        }
        yielding!(self.append_ledger_entry_once(entry))
    }

    async fn list_ledger_entries(
        &self,
        instructor_id: InstructorId,
        since: DateTime<Utc>,
    ) -> RepositoryResult<Vec<LedgerEntry>> {
        yielding!(self.list_ledger_entries(instructor_id, since))
    }
}

#[async_trait]
impl DispatchRepository for YieldingRepository {
    async fn create_dispatch(
        &self,
        assignment_ids: &[AssignmentId],
        created_at: DateTime<Utc>,
    ) -> RepositoryResult<DispatchCreation> {
        yielding!(self.create_dispatch(assignment_ids, created_at))
    }

    async fn list_deliveries(
        &self,
        dispatch_id: DispatchId,
    ) -> RepositoryResult<Vec<DispatchAssignment>> {
        yielding!(self.list_deliveries(dispatch_id))
    }

    async fn find_delivery(
        &self,
        assignment_id: AssignmentId,
    ) -> RepositoryResult<Option<DispatchAssignment>> {
        yielding!(self.find_delivery(assignment_id))
    }

    async fn claim_delivery(
        &self,
        expected: &DispatchAssignment,
        started_at: DateTime<Utc>,
    ) -> RepositoryResult<Option<DispatchAssignment>> {
        yielding!(self.claim_delivery(expected, started_at))
    }

    async fn update_delivery(&self, delivery: &DispatchAssignment) -> RepositoryResult<()> {
        let outcome = matches!(
            delivery.status,
            DeliveryStatus::Sent | DeliveryStatus::Failed | DeliveryStatus::Abandoned
        );
        if outcome && Self::take(&self.failing_outcome_writes) {
            return Err(RepositoryError::unavailable("delivery write dropped"));
        }
        yielding!(self.update_delivery(delivery))
    }

    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        orphan_after: chrono::Duration,
    ) -> RepositoryResult<Vec<DispatchAssignment>> {
        yielding!(self.list_due_retries(now, orphan_after))
    }

    async fn list_unanswered(
        &self,
        cutoff: DateTime<Utc>,
    ) -> RepositoryResult<Vec<DispatchAssignment>> {
        yielding!(self.list_unanswered(cutoff))
    }

    async fn mark_penalized(
        &self,
        dispatch_id: DispatchId,
        assignment_id: AssignmentId,
    ) -> RepositoryResult<bool> {
        yielding!(self.mark_penalized(dispatch_id, assignment_id))
    }
}
