//! Roster repository: the administrative data the engine reads.

use async_trait::async_trait;
use chrono::NaiveDate;

use super::error::RepositoryResult;
use crate::models::{
    Instructor, InstructorId, TrainingLocation, Unit, UnitId, UnitSchedule,
};

/// Units, their derived schedules and locations, instructors and availability.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` to work with async Rust.
#[async_trait]
pub trait RosterRepository: Send + Sync {
    /// Check if the storage connection is healthy.
    ///
    /// # Returns
    /// - `Ok(true)` if connection is healthy
    /// - `Ok(false)` if connection is unhealthy but no error occurred
    async fn health_check(&self) -> RepositoryResult<bool>;

    // ==================== Units ====================

    /// Create or update a unit and regenerate its schedule dates.
    ///
    /// Dates that survive the change keep their schedule id; dates no longer
    /// in the effective window are dropped; new dates get fresh ids.
    ///
    /// # Arguments
    /// * `unit` - The unit; `id: None` creates a new one
    ///
    /// # Returns
    /// * `Ok(Unit)` - The stored unit with its id assigned
    /// * `Err(RepositoryError::NotFound)` - If `unit.id` names a missing unit
    async fn store_unit(&self, unit: &Unit) -> RepositoryResult<Unit>;

    async fn get_unit(&self, unit_id: UnitId) -> RepositoryResult<Unit>;

    /// All units ordered by id.
    async fn list_units(&self) -> RepositoryResult<Vec<Unit>>;

    /// Schedule dates for a unit, ascending.
    async fn list_schedules(&self, unit_id: UnitId) -> RepositoryResult<Vec<UnitSchedule>>;

    // ==================== Training Locations ====================

    /// Create or update a training location.
    ///
    /// # Returns
    /// * `Err(RepositoryError::NotFound)` - If the owning unit does not exist
    async fn store_location(&self, location: &TrainingLocation)
        -> RepositoryResult<TrainingLocation>;

    /// Locations for a unit ordered by id.
    async fn list_locations(&self, unit_id: UnitId) -> RepositoryResult<Vec<TrainingLocation>>;

    // ==================== Instructors ====================

    async fn store_instructor(&self, instructor: &Instructor) -> RepositoryResult<Instructor>;

    async fn get_instructor(&self, instructor_id: InstructorId) -> RepositoryResult<Instructor>;

    async fn list_instructors(&self) -> RepositoryResult<Vec<Instructor>>;

    // ==================== Availability ====================

    /// Record that an instructor can work on `date`.
    ///
    /// # Returns
    /// * `Ok(true)` if newly recorded, `Ok(false)` if it was already declared
    async fn declare_availability(
        &self,
        instructor_id: InstructorId,
        date: NaiveDate,
    ) -> RepositoryResult<bool>;

    /// Instructors who declared `date`, ordered by id.
    async fn list_available_instructors(
        &self,
        date: NaiveDate,
    ) -> RepositoryResult<Vec<InstructorId>>;
}
