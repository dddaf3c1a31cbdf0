//! Fairness ledger.
//!
//! Credits and penalties are kept as an append-only event log. The score is a
//! pure fold over the entries inside the lookback window, so old events decay
//! out without anything being rewritten.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::FairnessSettings;
use crate::db::repository::{FullRepository, LedgerRepository};
use crate::error::EngineResult;
use crate::models::{AssignmentId, InstructorId, LedgerEntry, LedgerKind};

/// Why a penalty is recorded. Magnitudes come from configuration unless given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PenaltyReason {
    /// Delivered notification left unanswered past the response timeout.
    NoResponse,
    /// Rejections inside the lookback window reached the threshold.
    ExcessiveRejection,
    Manual { magnitude: i64, note: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditReason {
    /// Accepted assignment whose training date has passed.
    Completion(AssignmentId),
    Manual { magnitude: i64, note: String },
}

/// Ledger reason text for a completion credit.
fn completion_note(assignment_id: AssignmentId) -> String {
    format!("completion of {}", assignment_id)
}

/// Sum of signed magnitudes for entries recorded at or after `since`.
pub fn fold_score(entries: &[LedgerEntry], since: DateTime<Utc>) -> i64 {
    entries
        .iter()
        .filter(|e| e.recorded_at >= since)
        .map(LedgerEntry::signed_magnitude)
        .sum()
}

#[derive(Clone)]
pub struct FairnessLedger {
    repo: Arc<dyn FullRepository>,
    settings: FairnessSettings,
}

impl FairnessLedger {
    pub fn new(repo: Arc<dyn FullRepository>, settings: FairnessSettings) -> Self {
        Self { repo, settings }
    }

    pub fn settings(&self) -> &FairnessSettings {
        &self.settings
    }

    /// Start of the lookback window ending at `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.settings.lookback()
    }

    /// Current fairness score: credits minus penalties inside the window.
    pub async fn score(
        &self,
        instructor_id: InstructorId,
        now: DateTime<Utc>,
    ) -> EngineResult<i64> {
        let since = self.window_start(now);
        let entries = self.repo.list_ledger_entries(instructor_id, since).await?;
        Ok(fold_score(&entries, since))
    }

    pub async fn scores(
        &self,
        instructor_ids: &[InstructorId],
        now: DateTime<Utc>,
    ) -> EngineResult<HashMap<InstructorId, i64>> {
        let mut scores = HashMap::with_capacity(instructor_ids.len());
        for id in instructor_ids {
            scores.insert(*id, self.score(*id, now).await?);
        }
        Ok(scores)
    }

    pub async fn record_penalty(
        &self,
        instructor_id: InstructorId,
        reason: PenaltyReason,
        now: DateTime<Utc>,
    ) -> EngineResult<LedgerEntry> {
        let (magnitude, text) = match reason {
            PenaltyReason::NoResponse => {
                (self.settings.no_response_penalty, "no response".to_string())
            }
            PenaltyReason::ExcessiveRejection => (
                self.settings.rejection_penalty,
                "excessive rejection".to_string(),
            ),
            PenaltyReason::Manual { magnitude, note } => (magnitude, note),
        };
        info!(%instructor_id, magnitude, reason = %text, "recording penalty");
        self.append(instructor_id, LedgerKind::Penalty, magnitude, text, now)
            .await
    }

    /// Record a credit. A completion is credited once per assignment over the
    /// instructor's whole history; `None` means it already was.
    pub async fn record_credit(
        &self,
        instructor_id: InstructorId,
        reason: CreditReason,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<LedgerEntry>> {
        match reason {
            CreditReason::Completion(assignment_id) => {
                let entry = LedgerEntry {
                    instructor_id,
                    kind: LedgerKind::Credit,
                    magnitude: self.settings.completion_credit,
                    reason: completion_note(assignment_id),
                    recorded_at: now,
                };
                if !self.repo.append_ledger_entry_once(&entry).await? {
                    debug!(%instructor_id, %assignment_id, "completion already credited");
                    return Ok(None);
                }
                info!(
                    %instructor_id,
                    magnitude = entry.magnitude,
                    reason = %entry.reason,
                    "recording credit"
                );
                Ok(Some(entry))
            }
            CreditReason::Manual { magnitude, note } => {
                info!(%instructor_id, magnitude, reason = %note, "recording credit");
                self.append(instructor_id, LedgerKind::Credit, magnitude, note, now)
                    .await
                    .map(Some)
            }
        }
    }

    /// Audit-only event; never changes the score.
    pub async fn record_notice(
        &self,
        instructor_id: InstructorId,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> EngineResult<LedgerEntry> {
        self.append(instructor_id, LedgerKind::Notice, 0, reason.into(), now)
            .await
    }

    async fn append(
        &self,
        instructor_id: InstructorId,
        kind: LedgerKind,
        magnitude: i64,
        reason: String,
        now: DateTime<Utc>,
    ) -> EngineResult<LedgerEntry> {
        let entry = LedgerEntry {
            instructor_id,
            kind,
            magnitude,
            reason,
            recorded_at: now,
        };
        self.repo.append_ledger_entry(&entry).await?;
        Ok(entry)
    }
}
