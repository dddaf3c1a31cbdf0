use thiserror::Error;

use crate::db::repository::RepositoryError;
use crate::models::{AssignmentId, AssignmentState, InstructorId, UnitId};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Assignment {assignment} cannot go from {from} to {attempted}")]
    InvalidTransition {
        assignment: AssignmentId,
        from: AssignmentState,
        attempted: AssignmentState,
    },

    #[error("Distance between {instructor} and {unit} unavailable: {reason}")]
    DistanceUnavailable {
        instructor: InstructorId,
        unit: UnitId,
        reason: String,
    },

    #[error("Assignment {assignment} cannot be completed: {reason}")]
    NotCompletable {
        assignment: AssignmentId,
        reason: String,
    },

    #[error("Assignment not found: {0}")]
    AssignmentNotFound(AssignmentId),

    #[error("A matching run is already in progress")]
    RunInProgress,

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl EngineError {
    /// Repository not-found errors for assignments become `AssignmentNotFound`.
    pub fn for_assignment(assignment: AssignmentId, err: RepositoryError) -> Self {
        if err.is_not_found() {
            EngineError::AssignmentNotFound(assignment)
        } else {
            EngineError::Repository(err)
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
