//! Fairness ledger entries and cached distance facts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{InstructorId, UnitId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Credit,
    Penalty,
    /// Audit-only; never contributes to the score.
    Notice,
}

/// Append-only fairness event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub instructor_id: InstructorId,
    pub kind: LedgerKind,
    pub magnitude: i64,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Signed contribution to the fairness score.
    pub fn signed_magnitude(&self) -> i64 {
        match self.kind {
            LedgerKind::Credit => self.magnitude,
            LedgerKind::Penalty => -self.magnitude,
            LedgerKind::Notice => 0,
        }
    }
}

/// Memoized travel distance between an instructor and a unit.
///
/// Unique per (instructor, unit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceRecord {
    pub instructor_id: InstructorId,
    pub unit_id: UnitId,
    pub distance_meters: u64,
    pub duration_seconds: u64,
    pub resolved_at: DateTime<Utc>,
}
