//! Instructor-to-unit assignments and their lifecycle states.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AssignmentId, InstructorId, ScheduleId, UnitId};

/// Lifecycle state of an assignment.
///
/// `Pending` awaits a decision. `Accepted` can still be canceled
/// administratively; `Rejected` and `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentState {
    Pending,
    Accepted,
    Rejected,
    Canceled,
}

impl AssignmentState {
    /// Pending and Accepted assignments hold their slot.
    pub fn is_active(self) -> bool {
        matches!(self, AssignmentState::Pending | AssignmentState::Accepted)
    }
}

impl std::fmt::Display for AssignmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssignmentState::Pending => write!(f, "pending"),
            AssignmentState::Accepted => write!(f, "accepted"),
            AssignmentState::Rejected => write!(f, "rejected"),
            AssignmentState::Canceled => write!(f, "canceled"),
        }
    }
}

/// Instructor's answer to a pending assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Main,
    Lead,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Main => write!(f, "main"),
            Role::Lead => write!(f, "lead"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A reservation produced by the matching engine, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAssignment {
    pub instructor_id: InstructorId,
    pub unit_id: UnitId,
    pub schedule_id: ScheduleId,
    pub date: NaiveDate,
    pub role: Role,
    pub run_id: Uuid,
}

/// Binds one instructor to one unit schedule date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub instructor_id: InstructorId,
    pub unit_id: UnitId,
    pub schedule_id: ScheduleId,
    pub date: NaiveDate,
    pub role: Role,
    pub state: AssignmentState,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl Assignment {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}
