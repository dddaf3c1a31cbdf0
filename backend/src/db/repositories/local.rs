//! In-memory local repository implementation.
//!
//! Stores every record in ordered maps behind a single `RwLock`. Each trait
//! method takes the lock once, so every multi-record write (a reservation
//! batch, a dispatch with its delivery tasks, a unit with its regenerated
//! schedule) is applied atomically.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::db::repository::*;
use crate::models::*;

/// In-memory local repository.
///
/// Used by the test suite and the demo runner. Cloning shares the underlying
/// storage.
///
/// # Example
/// ```
/// use instructor_dispatch::db::repositories::LocalRepository;
/// use instructor_dispatch::db::repository::RosterRepository;
///
/// # tokio_test_block_on(async {
/// let repo = LocalRepository::new();
/// assert!(repo.health_check().await.unwrap());
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
#[derive(Clone)]
pub struct LocalRepository {
    data: Arc<RwLock<LocalData>>,
}

struct LocalData {
    units: BTreeMap<UnitId, Unit>,
    schedules: BTreeMap<ScheduleId, UnitSchedule>,
    locations: BTreeMap<LocationId, TrainingLocation>,
    instructors: BTreeMap<InstructorId, Instructor>,
    availability: BTreeSet<(NaiveDate, InstructorId)>,

    distances: HashMap<(InstructorId, UnitId), DistanceRecord>,
    ledger: Vec<LedgerEntry>,

    assignments: BTreeMap<AssignmentId, Assignment>,
    dispatches: BTreeMap<DispatchId, Dispatch>,
    deliveries: BTreeMap<(DispatchId, AssignmentId), DispatchAssignment>,

    // ID counters
    next_unit_id: i64,
    next_schedule_id: i64,
    next_location_id: i64,
    next_instructor_id: i64,
    next_assignment_id: i64,
    next_dispatch_id: i64,

    // Failure injection
    is_healthy: bool,
    fail_next_commit: bool,
}

impl Default for LocalData {
    fn default() -> Self {
        Self {
            units: BTreeMap::new(),
            schedules: BTreeMap::new(),
            locations: BTreeMap::new(),
            instructors: BTreeMap::new(),
            availability: BTreeSet::new(),
            distances: HashMap::new(),
            ledger: Vec::new(),
            assignments: BTreeMap::new(),
            dispatches: BTreeMap::new(),
            deliveries: BTreeMap::new(),
            next_unit_id: 1,
            next_schedule_id: 1,
            next_location_id: 1,
            next_instructor_id: 1,
            next_assignment_id: 1,
            next_dispatch_id: 1,
            is_healthy: true,
            fail_next_commit: false,
        }
    }
}

impl LocalData {
    fn check_health(&self) -> RepositoryResult<()> {
        if !self.is_healthy {
            return Err(RepositoryError::unavailable("Repository is not healthy"));
        }
        Ok(())
    }

    fn latest_delivery(&self, assignment_id: AssignmentId) -> Option<&DispatchAssignment> {
        self.deliveries
            .values()
            .filter(|d| d.assignment_id == assignment_id)
            .max_by_key(|d| d.dispatch_id)
    }

    fn demand_for(&self, unit_id: UnitId) -> u32 {
        self.locations
            .values()
            .filter(|l| l.unit_id == unit_id)
            .map(|l| l.instructors_required)
            .sum()
    }

    /// Validate a batch against stored state without writing anything.
    fn validate_batch(&self, batch: &[NewAssignment]) -> RepositoryResult<()> {
        let mut booked: HashSet<(InstructorId, NaiveDate)> = HashSet::new();
        let mut load: HashMap<(UnitId, NaiveDate), u32> = HashMap::new();
        for a in self.assignments.values().filter(|a| a.is_active()) {
            booked.insert((a.instructor_id, a.date));
            *load.entry((a.unit_id, a.date)).or_default() += 1;
        }

        for entry in batch {
            let ctx = ErrorContext::new("commit_assignments")
                .with_entity("assignment")
                .with_entity_id(entry.instructor_id);

            let schedule = self.schedules.get(&entry.schedule_id).ok_or_else(|| {
                RepositoryError::conflict(format!("Schedule {} does not exist", entry.schedule_id))
                    .with_context(ctx.clone())
            })?;
            if schedule.unit_id != entry.unit_id || schedule.date != entry.date {
                return Err(RepositoryError::conflict(format!(
                    "Schedule {} is {} on {}, not {} on {}",
                    schedule.id, schedule.unit_id, schedule.date, entry.unit_id, entry.date
                ))
                .with_context(ctx));
            }
            if !self.instructors.contains_key(&entry.instructor_id) {
                return Err(RepositoryError::conflict(format!(
                    "Instructor {} does not exist",
                    entry.instructor_id
                ))
                .with_context(ctx));
            }
            if !booked.insert((entry.instructor_id, entry.date)) {
                return Err(RepositoryError::conflict(format!(
                    "{} already holds an active assignment on {}",
                    entry.instructor_id, entry.date
                ))
                .with_context(ctx.with_details("double_booking")));
            }
            let count = load.entry((entry.unit_id, entry.date)).or_default();
            *count += 1;
            let demand = self.demand_for(entry.unit_id);
            if *count > demand {
                return Err(RepositoryError::conflict(format!(
                    "{} on {} would exceed demand of {}",
                    entry.unit_id, entry.date, demand
                ))
                .with_context(ctx.with_details("capacity_overrun")));
            }
        }
        Ok(())
    }
}

impl LocalRepository {
    /// Create a new empty local repository.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(LocalData::default())),
        }
    }

    /// Set the health status for testing connection failures.
    pub fn set_healthy(&self, healthy: bool) {
        self.data.write().is_healthy = healthy;
    }

    /// Make the next `commit_assignments` fail after validation, before any
    /// write. Used to exercise all-or-nothing behaviour.
    pub fn fail_next_commit(&self) {
        self.data.write().fail_next_commit = true;
    }

    /// Number of assignments stored, any state.
    pub fn assignment_count(&self) -> usize {
        self.data.read().assignments.len()
    }

    /// Number of ledger entries stored, any kind.
    pub fn ledger_len(&self) -> usize {
        self.data.read().ledger.len()
    }

    /// Clear all data from the repository.
    pub fn clear(&self) {
        let mut data = self.data.write();
        let healthy = data.is_healthy;
        *data = LocalData {
            is_healthy: healthy,
            ..Default::default()
        };
    }
}

impl Default for LocalRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RosterRepository for LocalRepository {
    async fn health_check(&self) -> RepositoryResult<bool> {
        Ok(self.data.read().is_healthy)
    }

    async fn store_unit(&self, unit: &Unit) -> RepositoryResult<Unit> {
        let mut data = self.data.write();
        data.check_health()?;

        let unit_id = match unit.id {
            Some(id) => {
                if !data.units.contains_key(&id) {
                    return Err(RepositoryError::not_found(format!("Unit {} not found", id))
                        .with_context(ErrorContext::new("store_unit").with_entity_id(id)));
                }
                id
            }
            None => {
                let id = UnitId(data.next_unit_id);
                data.next_unit_id += 1;
                id
            }
        };

        let mut stored = unit.clone();
        stored.id = Some(unit_id);

        let wanted: BTreeSet<NaiveDate> = stored.effective_dates().into_iter().collect();
        let existing: HashMap<NaiveDate, ScheduleId> = data
            .schedules
            .values()
            .filter(|s| s.unit_id == unit_id)
            .map(|s| (s.date, s.id))
            .collect();

        data.schedules
            .retain(|_, s| s.unit_id != unit_id || wanted.contains(&s.date));
        for date in &wanted {
            if !existing.contains_key(date) {
                let id = ScheduleId(data.next_schedule_id);
                data.next_schedule_id += 1;
                data.schedules.insert(
                    id,
                    UnitSchedule {
                        id,
                        unit_id,
                        date: *date,
                    },
                );
            }
        }
        debug!(
            "Stored {} with {} schedule dates ({} previously)",
            unit_id,
            wanted.len(),
            existing.len()
        );

        data.units.insert(unit_id, stored.clone());
        Ok(stored)
    }

    async fn get_unit(&self, unit_id: UnitId) -> RepositoryResult<Unit> {
        let data = self.data.read();
        data.check_health()?;
        data.units
            .get(&unit_id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found(format!("Unit {} not found", unit_id)))
    }

    async fn list_units(&self) -> RepositoryResult<Vec<Unit>> {
        let data = self.data.read();
        data.check_health()?;
        Ok(data.units.values().cloned().collect())
    }

    async fn list_schedules(&self, unit_id: UnitId) -> RepositoryResult<Vec<UnitSchedule>> {
        let data = self.data.read();
        data.check_health()?;
        let mut schedules: Vec<UnitSchedule> = data
            .schedules
            .values()
            .filter(|s| s.unit_id == unit_id)
            .cloned()
            .collect();
        schedules.sort_by_key(|s| s.date);
        Ok(schedules)
    }

    async fn store_location(
        &self,
        location: &TrainingLocation,
    ) -> RepositoryResult<TrainingLocation> {
        let mut data = self.data.write();
        data.check_health()?;
        if !data.units.contains_key(&location.unit_id) {
            return Err(RepositoryError::not_found(format!(
                "Unit {} not found",
                location.unit_id
            )));
        }
        let id = match location.id {
            Some(id) => id,
            None => {
                let id = LocationId(data.next_location_id);
                data.next_location_id += 1;
                id
            }
        };
        let mut stored = location.clone();
        stored.id = Some(id);
        data.locations.insert(id, stored.clone());
        Ok(stored)
    }

    async fn list_locations(&self, unit_id: UnitId) -> RepositoryResult<Vec<TrainingLocation>> {
        let data = self.data.read();
        data.check_health()?;
        Ok(data
            .locations
            .values()
            .filter(|l| l.unit_id == unit_id)
            .cloned()
            .collect())
    }

    async fn store_instructor(&self, instructor: &Instructor) -> RepositoryResult<Instructor> {
        let mut data = self.data.write();
        data.check_health()?;
        let id = match instructor.id {
            Some(id) => id,
            None => {
                let id = InstructorId(data.next_instructor_id);
                data.next_instructor_id += 1;
                id
            }
        };
        let mut stored = instructor.clone();
        stored.id = Some(id);
        data.instructors.insert(id, stored.clone());
        Ok(stored)
    }

    async fn get_instructor(&self, instructor_id: InstructorId) -> RepositoryResult<Instructor> {
        let data = self.data.read();
        data.check_health()?;
        data.instructors.get(&instructor_id).cloned().ok_or_else(|| {
            RepositoryError::not_found(format!("Instructor {} not found", instructor_id))
        })
    }

    async fn list_instructors(&self) -> RepositoryResult<Vec<Instructor>> {
        let data = self.data.read();
        data.check_health()?;
        Ok(data.instructors.values().cloned().collect())
    }

    async fn declare_availability(
        &self,
        instructor_id: InstructorId,
        date: NaiveDate,
    ) -> RepositoryResult<bool> {
        let mut data = self.data.write();
        data.check_health()?;
        if !data.instructors.contains_key(&instructor_id) {
            return Err(RepositoryError::not_found(format!(
                "Instructor {} not found",
                instructor_id
            )));
        }
        Ok(data.availability.insert((date, instructor_id)))
    }

    async fn list_available_instructors(
        &self,
        date: NaiveDate,
    ) -> RepositoryResult<Vec<InstructorId>> {
        let data = self.data.read();
        data.check_health()?;
        Ok(data
            .availability
            .range((date, InstructorId(i64::MIN))..=(date, InstructorId(i64::MAX)))
            .map(|(_, id)| *id)
            .collect())
    }
}

#[async_trait]
impl AssignmentRepository for LocalRepository {
    async fn commit_assignments(
        &self,
        batch: &[NewAssignment],
        created_at: DateTime<Utc>,
    ) -> RepositoryResult<Vec<Assignment>> {
        let mut data = self.data.write();
        data.check_health()?;
        data.validate_batch(batch)?;

        if data.fail_next_commit {
            data.fail_next_commit = false;
            warn!("Injected commit failure for batch of {}", batch.len());
            return Err(RepositoryError::aborted("Commit aborted; batch rolled back")
                .with_context(ErrorContext::new("commit_assignments")));
        }

        let mut created = Vec::with_capacity(batch.len());
        for entry in batch {
            let id = AssignmentId(data.next_assignment_id);
            data.next_assignment_id += 1;
            let assignment = Assignment {
                id,
                instructor_id: entry.instructor_id,
                unit_id: entry.unit_id,
                schedule_id: entry.schedule_id,
                date: entry.date,
                role: entry.role,
                state: AssignmentState::Pending,
                run_id: entry.run_id,
                created_at,
                decided_at: None,
            };
            data.assignments.insert(id, assignment.clone());
            created.push(assignment);
        }
        Ok(created)
    }

    async fn get_assignment(&self, assignment_id: AssignmentId) -> RepositoryResult<Assignment> {
        let data = self.data.read();
        data.check_health()?;
        data.assignments.get(&assignment_id).cloned().ok_or_else(|| {
            RepositoryError::not_found(format!("Assignment {} not found", assignment_id))
                .with_context(
                    ErrorContext::new("get_assignment")
                        .with_entity("assignment")
                        .with_entity_id(assignment_id.value()),
                )
        })
    }

    async fn list_assignments(&self) -> RepositoryResult<Vec<Assignment>> {
        let data = self.data.read();
        data.check_health()?;
        Ok(data.assignments.values().cloned().collect())
    }

    async fn list_active_assignments_on(
        &self,
        date: NaiveDate,
    ) -> RepositoryResult<Vec<Assignment>> {
        let data = self.data.read();
        data.check_health()?;
        Ok(data
            .assignments
            .values()
            .filter(|a| a.date == date && a.is_active())
            .cloned()
            .collect())
    }

    async fn list_assignments_for_instructor(
        &self,
        instructor_id: InstructorId,
    ) -> RepositoryResult<Vec<Assignment>> {
        let data = self.data.read();
        data.check_health()?;
        Ok(data
            .assignments
            .values()
            .filter(|a| a.instructor_id == instructor_id)
            .cloned()
            .collect())
    }

    async fn compare_and_set_state(
        &self,
        assignment_id: AssignmentId,
        expected: AssignmentState,
        next: AssignmentState,
        decided_at: DateTime<Utc>,
    ) -> RepositoryResult<CasOutcome> {
        let mut data = self.data.write();
        data.check_health()?;
        let assignment = data.assignments.get_mut(&assignment_id).ok_or_else(|| {
            RepositoryError::not_found(format!("Assignment {} not found", assignment_id))
        })?;
        if assignment.state != expected {
            return Ok(CasOutcome::Stale(assignment.clone()));
        }
        assignment.state = next;
        assignment.decided_at = Some(decided_at);
        Ok(CasOutcome::Applied(assignment.clone()))
    }

    async fn clear_assignments(&self) -> RepositoryResult<usize> {
        let mut data = self.data.write();
        data.check_health()?;
        let removed = data.assignments.len();
        data.assignments.clear();
        data.dispatches.clear();
        data.deliveries.clear();
        Ok(removed)
    }
}

#[async_trait]
impl LedgerRepository for LocalRepository {
    async fn get_distance(
        &self,
        instructor_id: InstructorId,
        unit_id: UnitId,
    ) -> RepositoryResult<Option<DistanceRecord>> {
        let data = self.data.read();
        data.check_health()?;
        Ok(data.distances.get(&(instructor_id, unit_id)).cloned())
    }

    async fn upsert_distance(&self, record: &DistanceRecord) -> RepositoryResult<()> {
        let mut data = self.data.write();
        data.check_health()?;
        data.distances
            .insert((record.instructor_id, record.unit_id), record.clone());
        Ok(())
    }

    async fn append_ledger_entry(&self, entry: &LedgerEntry) -> RepositoryResult<()> {
        let mut data = self.data.write();
        data.check_health()?;
        data.ledger.push(entry.clone());
        Ok(())
    }

    async fn append_ledger_entry_once(&self, entry: &LedgerEntry) -> RepositoryResult<bool> {
        let mut data = self.data.write();
        data.check_health()?;
        let recorded = data.ledger.iter().any(|e| {
            e.instructor_id == entry.instructor_id && e.kind == entry.kind && e.reason == entry.reason
        });
        if recorded {
            debug!("Ledger entry '{}' already recorded", entry.reason);
            return Ok(false);
        }
        data.ledger.push(entry.clone());
        Ok(true)
    }

    async fn list_ledger_entries(
        &self,
        instructor_id: InstructorId,
        since: DateTime<Utc>,
    ) -> RepositoryResult<Vec<LedgerEntry>> {
        let data = self.data.read();
        data.check_health()?;
        Ok(data
            .ledger
            .iter()
            .filter(|e| e.instructor_id == instructor_id && e.recorded_at >= since)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DispatchRepository for LocalRepository {
    async fn create_dispatch(
        &self,
        assignment_ids: &[AssignmentId],
        created_at: DateTime<Utc>,
    ) -> RepositoryResult<DispatchCreation> {
        let mut data = self.data.write();
        data.check_health()?;

        let mut creation = DispatchCreation::default();
        let mut fresh = Vec::new();
        for assignment_id in assignment_ids {
            let assignment = data.assignments.get(assignment_id).ok_or_else(|| {
                RepositoryError::not_found(format!("Assignment {} not found", assignment_id))
                    .with_context(
                        ErrorContext::new("create_dispatch")
                            .with_entity("assignment")
                            .with_entity_id(assignment_id.value()),
                    )
            })?;
            let live = data
                .latest_delivery(*assignment_id)
                .map(DispatchAssignment::is_live)
                .unwrap_or(false);
            if assignment.state != AssignmentState::Pending || live || fresh.contains(assignment_id)
            {
                creation.skipped.push(*assignment_id);
            } else {
                fresh.push(*assignment_id);
            }
        }
        if fresh.is_empty() {
            return Ok(creation);
        }

        let id = DispatchId(data.next_dispatch_id);
        data.next_dispatch_id += 1;
        for assignment_id in &fresh {
            data.deliveries.insert(
                (id, *assignment_id),
                DispatchAssignment::scheduled(id, *assignment_id, created_at),
            );
        }
        let dispatch = Dispatch {
            id,
            assignment_ids: fresh,
            created_at,
        };
        data.dispatches.insert(id, dispatch.clone());
        debug!(
            "Created {} with {} deliveries, {} skipped",
            id,
            dispatch.assignment_ids.len(),
            creation.skipped.len()
        );
        creation.dispatch = Some(dispatch);
        Ok(creation)
    }

    async fn list_deliveries(
        &self,
        dispatch_id: DispatchId,
    ) -> RepositoryResult<Vec<DispatchAssignment>> {
        let data = self.data.read();
        data.check_health()?;
        Ok(data
            .deliveries
            .range((dispatch_id, AssignmentId(i64::MIN))..=(dispatch_id, AssignmentId(i64::MAX)))
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn find_delivery(
        &self,
        assignment_id: AssignmentId,
    ) -> RepositoryResult<Option<DispatchAssignment>> {
        let data = self.data.read();
        data.check_health()?;
        Ok(data.latest_delivery(assignment_id).cloned())
    }

    async fn claim_delivery(
        &self,
        expected: &DispatchAssignment,
        started_at: DateTime<Utc>,
    ) -> RepositoryResult<Option<DispatchAssignment>> {
        let mut data = self.data.write();
        data.check_health()?;
        let key = (expected.dispatch_id, expected.assignment_id);
        let stored = data.deliveries.get_mut(&key).ok_or_else(|| {
            RepositoryError::not_found(format!(
                "Delivery of {} in {} not found",
                expected.assignment_id, expected.dispatch_id
            ))
        })?;
        let claimable = matches!(
            stored.status,
            DeliveryStatus::Scheduled | DeliveryStatus::Failed | DeliveryStatus::InFlight
        );
        if !claimable
            || stored.status != expected.status
            || stored.attempts != expected.attempts
            || stored.attempt_started_at != expected.attempt_started_at
        {
            debug!(
                "Claim of {} in {} lost: now {} after {} attempts",
                stored.assignment_id, stored.dispatch_id, stored.status, stored.attempts
            );
            return Ok(None);
        }
        stored.status = DeliveryStatus::InFlight;
        stored.attempts += 1;
        stored.attempt_started_at = Some(started_at);
        stored.next_attempt_at = None;
        Ok(Some(stored.clone()))
    }

    async fn update_delivery(&self, delivery: &DispatchAssignment) -> RepositoryResult<()> {
        let mut data = self.data.write();
        data.check_health()?;
        let key = (delivery.dispatch_id, delivery.assignment_id);
        match data.deliveries.get_mut(&key) {
            Some(slot) => {
                *slot = delivery.clone();
                Ok(())
            }
            None => Err(RepositoryError::not_found(format!(
                "Delivery of {} in {} not found",
                delivery.assignment_id, delivery.dispatch_id
            ))),
        }
    }

    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        orphan_after: chrono::Duration,
    ) -> RepositoryResult<Vec<DispatchAssignment>> {
        let data = self.data.read();
        data.check_health()?;
        Ok(data
            .deliveries
            .values()
            .filter(|d| d.is_due(now, orphan_after))
            .cloned()
            .collect())
    }

    async fn list_unanswered(
        &self,
        cutoff: DateTime<Utc>,
    ) -> RepositoryResult<Vec<DispatchAssignment>> {
        let data = self.data.read();
        data.check_health()?;
        Ok(data
            .deliveries
            .values()
            .filter(|d| {
                d.status == DeliveryStatus::Sent
                    && !d.penalized
                    && d.sent_at.map(|t| t <= cutoff).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn mark_penalized(
        &self,
        dispatch_id: DispatchId,
        assignment_id: AssignmentId,
    ) -> RepositoryResult<bool> {
        let mut data = self.data.write();
        data.check_health()?;
        let stored = data
            .deliveries
            .get_mut(&(dispatch_id, assignment_id))
            .ok_or_else(|| {
                RepositoryError::not_found(format!(
                    "Delivery of {} in {} not found",
                    assignment_id, dispatch_id
                ))
            })?;
        if stored.penalized || stored.status != DeliveryStatus::Sent {
            return Ok(false);
        }
        stored.penalized = true;
        Ok(true)
    }
}
