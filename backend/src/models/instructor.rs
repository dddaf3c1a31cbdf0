//! Instructors and their declared availability.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{InstructorId, Place};

/// Where a notification for an instructor goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instructor {
    pub id: Option<InstructorId>,
    pub name: String,
    pub team: Option<String>,
    /// Home base used as the origin for distance lookups.
    pub place: Place,
    pub contact: Contact,
    /// Only instructors with a complete profile are matched.
    pub profile_complete: bool,
}

/// One declared available date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstructorAvailability {
    pub instructor_id: InstructorId,
    pub date: NaiveDate,
}
