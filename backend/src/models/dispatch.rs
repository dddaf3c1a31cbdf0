//! Notification runs and per-assignment delivery tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AssignmentId, DispatchId};

/// State of one delivery task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, waiting for its first claim.
    Scheduled,
    /// Claimed by an attempt that has not finished yet.
    InFlight,
    Sent,
    /// Last attempt failed; `next_attempt_at` says when to try again.
    Failed,
    /// Gave up after the maximum number of attempts.
    Abandoned,
    /// The assignment left `Pending` before the notification went out.
    Withdrawn,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeliveryStatus::Scheduled => "scheduled",
            DeliveryStatus::InFlight => "in_flight",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Abandoned => "abandoned",
            DeliveryStatus::Withdrawn => "withdrawn",
        };
        f.write_str(s)
    }
}

/// One notification run. Its assignment set is fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispatch {
    pub id: DispatchId,
    pub assignment_ids: Vec<AssignmentId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchAssignment {
    pub dispatch_id: DispatchId,
    pub assignment_id: AssignmentId,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the current or most recent attempt claimed the task.
    pub attempt_started_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Set once the response-timeout penalty has been recorded.
    pub penalized: bool,
}

impl DispatchAssignment {
    /// A fresh task whose first attempt is due at `created_at`.
    pub fn scheduled(
        dispatch_id: DispatchId,
        assignment_id: AssignmentId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            dispatch_id,
            assignment_id,
            status: DeliveryStatus::Scheduled,
            attempts: 0,
            last_error: None,
            next_attempt_at: Some(created_at),
            attempt_started_at: None,
            sent_at: None,
            penalized: false,
        }
    }

    /// Anything but an abandoned or withdrawn task still speaks for its assignment.
    pub fn is_live(&self) -> bool {
        !matches!(
            self.status,
            DeliveryStatus::Abandoned | DeliveryStatus::Withdrawn
        )
    }

    /// Whether a retry pass at `now` should pick this task up.
    ///
    /// `Failed` tasks are due once their backoff has elapsed. `Scheduled` and
    /// `InFlight` tasks are due only once they have sat untouched for
    /// `orphan_after`: the attempt that owned them never finished.
    pub fn is_due(&self, now: DateTime<Utc>, orphan_after: chrono::Duration) -> bool {
        let stale_before = now - orphan_after;
        match self.status {
            DeliveryStatus::Failed => self.next_attempt_at.map_or(true, |t| t <= now),
            DeliveryStatus::Scheduled => self.next_attempt_at.map_or(true, |t| t <= stale_before),
            DeliveryStatus::InFlight => self.attempt_started_at.map_or(true, |t| t <= stale_before),
            _ => false,
        }
    }
}
