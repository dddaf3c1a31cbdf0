//! Dispatch pipeline: notifies instructors of new assignments.
//!
//! A dispatch groups the assignments handed to it into one run and tries
//! each delivery concurrently. Failed deliveries are retried with
//! exponential backoff by [`RetryScheduler`] until they succeed or run out of
//! attempts. Before every attempt the assignment is read again; if it has
//! left `Pending` the delivery is withdrawn without calling the transport.
//!
//! Only the caller that wins the repository claim on a delivery calls the
//! transport, so overlapping dispatches and retry passes never send the same
//! attempt twice. A claimed delivery that never reports back is picked up
//! again once it is older than the send timeout.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::db::repository::{
    AssignmentRepository, DispatchRepository, FullRepository, RosterRepository,
};
use crate::error::EngineResult;
use crate::models::{
    Assignment, AssignmentId, AssignmentState, DeliveryStatus, Dispatch, DispatchAssignment,
};
use crate::services::fairness::{FairnessLedger, PenaltyReason};
use crate::services::notifier::{NotificationMessage, NotificationTransport, TransportError};
use crate::services::run_tracker::{LogLevel, RunKind, RunTracker};

/// Delivery outcomes of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTally {
    pub sent: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub withdrawn: usize,
    /// Attempts that could not be carried out (repository failures).
    pub errors: Vec<String>,
}

impl DeliveryTally {
    fn record(&mut self, outcome: EngineResult<DeliveryStatus>) {
        match outcome {
            Ok(DeliveryStatus::Sent) => self.sent += 1,
            Ok(DeliveryStatus::Failed) => self.failed += 1,
            Ok(DeliveryStatus::Abandoned) => self.abandoned += 1,
            Ok(DeliveryStatus::Withdrawn) => self.withdrawn += 1,
            Ok(other) => debug!(status = %other, "delivery left in intermediate state"),
            Err(err) => self.errors.push(err.to_string()),
        }
    }

    pub fn attempted(&self) -> usize {
        self.sent + self.failed + self.abandoned + self.withdrawn + self.errors.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// `None` when every assignment handed in was skipped.
    pub dispatch: Option<Dispatch>,
    /// Already notified, awaiting retry, or no longer pending.
    pub skipped: Vec<AssignmentId>,
    pub tally: DeliveryTally,
}

#[derive(Clone)]
pub struct DispatchPipeline {
    repo: Arc<dyn FullRepository>,
    transport: Arc<dyn NotificationTransport>,
    ledger: FairnessLedger,
    settings: DispatchSettings,
    tracker: RunTracker,
}

impl DispatchPipeline {
    pub fn new(
        repo: Arc<dyn FullRepository>,
        transport: Arc<dyn NotificationTransport>,
        ledger: FairnessLedger,
        settings: DispatchSettings,
        tracker: RunTracker,
    ) -> Self {
        Self {
            repo,
            transport,
            ledger,
            settings,
            tracker,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Notify the holders of `assignments`.
    ///
    /// Assignments that already have a live delivery (sent, in flight, or
    /// failed and waiting for a retry) are skipped, so calling this twice with
    /// the same batch, even concurrently, sends nothing the second time. Only
    /// abandoned and withdrawn deliveries are started over.
    pub async fn dispatch(
        &self,
        assignments: &[Assignment],
        now: DateTime<Utc>,
    ) -> EngineResult<DispatchReport> {
        let run_id = self.tracker.start_run(RunKind::Dispatch);
        match self.dispatch_inner(assignments, now, run_id).await {
            Ok(report) => {
                self.tracker.complete_run(run_id, serde_json::to_value(&report).ok());
                Ok(report)
            }
            Err(err) => {
                self.tracker.fail_run(run_id, err.to_string());
                Err(err)
            }
        }
    }

    async fn dispatch_inner(
        &self,
        assignments: &[Assignment],
        now: DateTime<Utc>,
        run_id: Uuid,
    ) -> EngineResult<DispatchReport> {
        let requested: Vec<AssignmentId> = assignments
            .iter()
            .map(|a| a.id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut report = DispatchReport::default();

        let creation = self.repo.create_dispatch(&requested, now).await?;
        report.skipped = creation.skipped;
        let Some(dispatch) = creation.dispatch else {
            self.tracker.log(
                run_id,
                LogLevel::Info,
                format!("nothing to send, {} skipped", report.skipped.len()),
            );
            return Ok(report);
        };
        let fresh = dispatch.assignment_ids.len();
        self.tracker.log(
            run_id,
            LogLevel::Info,
            format!("{} created for {} assignments", dispatch.id, fresh),
        );

        let deliveries = self.repo.list_deliveries(dispatch.id).await?;
        let outcomes = join_all(deliveries.into_iter().map(|d| self.attempt(d, now))).await;
        for outcome in outcomes {
            report.tally.record(outcome);
        }

        let level = if report.tally.sent == fresh {
            LogLevel::Success
        } else {
            LogLevel::Warning
        };
        self.tracker.log(
            run_id,
            level,
            format!(
                "{} sent, {} failed, {} abandoned, {} withdrawn",
                report.tally.sent,
                report.tally.failed,
                report.tally.abandoned,
                report.tally.withdrawn
            ),
        );
        info!(dispatch_id = %dispatch.id, sent = report.tally.sent, "dispatch finished");
        report.dispatch = Some(dispatch);
        Ok(report)
    }

    /// Attempt every failed delivery whose backoff has elapsed, and every
    /// claimed or scheduled one left unfinished for longer than the send timeout.
    pub async fn run_due_retries(&self, now: DateTime<Utc>) -> EngineResult<DeliveryTally> {
        let due = self
            .repo
            .list_due_retries(now, self.settings.orphan_after())
            .await?;
        let mut tally = DeliveryTally::default();
        if due.is_empty() {
            return Ok(tally);
        }
        debug!(due = due.len(), "retrying deliveries");
        for outcome in join_all(due.into_iter().map(|d| self.attempt(d, now))).await {
            tally.record(outcome);
        }
        Ok(tally)
    }

    /// Penalize instructors who left a delivered assignment unanswered for
    /// longer than the response timeout.
    ///
    /// The delivery is flagged before the penalty is written, so a delivery is
    /// penalized at most once even when sweeps overlap or the ledger write fails.
    pub async fn sweep_response_timeouts(
        &self,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<AssignmentId>> {
        let cutoff = now - self.settings.response_timeout();
        let mut penalized = Vec::new();
        for delivery in self.repo.list_unanswered(cutoff).await? {
            let assignment = self.repo.get_assignment(delivery.assignment_id).await?;
            if assignment.state != AssignmentState::Pending {
                continue;
            }
            if !self
                .repo
                .mark_penalized(delivery.dispatch_id, delivery.assignment_id)
                .await?
            {
                continue;
            }
            self.ledger
                .record_penalty(assignment.instructor_id, PenaltyReason::NoResponse, now)
                .await?;
            penalized.push(assignment.id);
        }
        if !penalized.is_empty() {
            info!(count = penalized.len(), "response timeouts penalized");
        }
        Ok(penalized)
    }

    /// Run one attempt for a delivery read as due. Reports `InFlight` when
    /// another caller claimed it first.
    async fn attempt(
        &self,
        mut delivery: DispatchAssignment,
        now: DateTime<Utc>,
    ) -> EngineResult<DeliveryStatus> {
        let assignment_id = delivery.assignment_id;
        let assignment = self.repo.get_assignment(assignment_id).await?;
        if assignment.state != AssignmentState::Pending {
            debug!(%assignment_id, state = %assignment.state, "withdrawing delivery");
            delivery.status = DeliveryStatus::Withdrawn;
            delivery.next_attempt_at = None;
            self.repo.update_delivery(&delivery).await?;
            return Ok(delivery.status);
        }

        let instructor = self.repo.get_instructor(assignment.instructor_id).await?;
        let unit = self.repo.get_unit(assignment.unit_id).await?;
        let locations = self.repo.list_locations(assignment.unit_id).await?;
        let message =
            NotificationMessage::for_assignment(&assignment, &unit, &locations, &instructor);

        let Some(mut delivery) = self.repo.claim_delivery(&delivery, now).await? else {
            debug!(%assignment_id, "delivery claimed by another pass");
            return Ok(DeliveryStatus::InFlight);
        };

        let sent = tokio::time::timeout(
            self.settings.send_timeout(),
            self.transport.send(&instructor.contact, &message),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout));
        match sent {
            Ok(()) => {
                delivery.status = DeliveryStatus::Sent;
                delivery.sent_at = Some(now);
                delivery.next_attempt_at = None;
                delivery.last_error = None;
            }
            Err(err)
                if !err.is_transient() || delivery.attempts >= self.settings.max_attempts =>
            {
                warn!(
                    %assignment_id,
                    attempts = delivery.attempts,
                    error = %err,
                    "delivery abandoned"
                );
                delivery.status = DeliveryStatus::Abandoned;
                delivery.next_attempt_at = None;
                delivery.last_error = Some(err.to_string());
                let note = format!(
                    "delivery of {} abandoned after {} attempts: {}",
                    assignment_id, delivery.attempts, err
                );
                if let Err(ledger_err) = self
                    .ledger
                    .record_notice(assignment.instructor_id, note, now)
                    .await
                {
                    warn!(
                        %assignment_id,
                        error = %ledger_err,
                        "could not record abandoned delivery"
                    );
                }
            }
            Err(err) => {
                let delay = self.settings.backoff(delivery.attempts);
                debug!(
                    %assignment_id,
                    attempts = delivery.attempts,
                    error = %err,
                    "delivery failed"
                );
                delivery.status = DeliveryStatus::Failed;
                delivery.next_attempt_at = Some(now + delay);
                delivery.last_error = Some(err.to_string());
            }
        }
        self.repo.update_delivery(&delivery).await?;
        Ok(delivery.status)
    }
}

/// Background loop that drives retries and the response-timeout sweep.
pub struct RetryScheduler;

impl RetryScheduler {
    /// Run every `period` until `shutdown` turns `true` or its sender is dropped.
    pub fn spawn(
        pipeline: Arc<DispatchPipeline>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        if let Err(err) = pipeline.run_due_retries(now).await {
                            warn!(error = %err, "retry pass failed");
                        }
                        if let Err(err) = pipeline.sweep_response_timeouts(now).await {
                            warn!(error = %err, "response timeout sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("retry scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FairnessSettings;
    use crate::db::repositories::LocalRepository;
    use crate::db::repository::LedgerRepository;
    use crate::models::*;
    use crate::services::notifier::TransportError;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Pops scripted results; succeeds once the script runs out.
    #[derive(Default)]
    struct ScriptTransport {
        script: Mutex<VecDeque<Result<(), TransportError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptTransport {
        fn failing(times: usize) -> Self {
            let script = (0..times)
                .map(|_| Err(TransportError::Unreachable("smtp down".into())))
                .collect();
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl NotificationTransport for ScriptTransport {
        async fn send(&self, _: &Contact, _: &NotificationMessage) -> Result<(), TransportError> {
            *self.calls.lock() += 1;
            self.script.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap()
    }

    async fn pending(repo: &LocalRepository) -> Assignment {
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let unit = repo
            .store_unit(&Unit {
                id: None,
                name: "Camp".into(),
                region: "west".into(),
                place: Place::new("Camp Road"),
                education_start: date,
                education_end: date,
                excluded_dates: Default::default(),
                work_hours: None,
                lunch_hours: None,
                officer: None,
            })
            .await
            .unwrap();
        let unit_id = unit.id.unwrap();
        repo.store_location(&TrainingLocation {
            id: None,
            unit_id,
            place: Place::new("Gym"),
            instructors_required: 1,
            planned_count: None,
            actual_count: None,
        })
        .await
        .unwrap();
        let instructor = repo
            .store_instructor(&Instructor {
                id: None,
                name: "Ola".into(),
                team: None,
                place: Place::new("Home"),
                contact: Contact {
                    email: Some("ola@example.org".into()),
                    phone: None,
                },
                profile_complete: true,
            })
            .await
            .unwrap();
        let schedule = repo.list_schedules(unit_id).await.unwrap()[0].clone();
        repo.commit_assignments(
            &[NewAssignment {
                instructor_id: instructor.id.unwrap(),
                unit_id,
                schedule_id: schedule.id,
                date,
                role: Role::Main,
                run_id: Uuid::nil(),
            }],
            now(),
        )
        .await
        .unwrap()
        .remove(0)
    }

    fn pipeline(repo: &LocalRepository, transport: Arc<ScriptTransport>) -> DispatchPipeline {
        let shared: Arc<dyn FullRepository> = Arc::new(repo.clone());
        DispatchPipeline::new(
            shared.clone(),
            transport,
            FairnessLedger::new(shared, FairnessSettings::default()),
            DispatchSettings {
                max_attempts: 3,
                base_backoff_ms: 1_000,
                max_backoff_ms: 10_000,
                ..Default::default()
            },
            RunTracker::new(),
        )
    }

    #[tokio::test]
    async fn redispatching_a_sent_assignment_is_a_no_op() {
        let repo = LocalRepository::new();
        let assignment = pending(&repo).await;
        let transport = Arc::new(ScriptTransport::default());
        let pipeline = pipeline(&repo, transport.clone());

        let first = pipeline.dispatch(&[assignment.clone()], now()).await.unwrap();
        assert_eq!(first.tally.sent, 1);
        assert!(first.dispatch.is_some());

        let second = pipeline.dispatch(&[assignment.clone()], now()).await.unwrap();
        assert!(second.dispatch.is_none());
        assert_eq!(second.skipped, vec![assignment.id]);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn failure_backs_off_then_retries() {
        let repo = LocalRepository::new();
        let assignment = pending(&repo).await;
        let transport = Arc::new(ScriptTransport::failing(1));
        let pipeline = pipeline(&repo, transport.clone());

        let report = pipeline.dispatch(&[assignment.clone()], now()).await.unwrap();
        assert_eq!(report.tally.failed, 1);
        let delivery = repo.find_delivery(assignment.id).await.unwrap().unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert_eq!(delivery.next_attempt_at, Some(now() + chrono::Duration::seconds(1)));

        // Not due yet.
        let early = pipeline.run_due_retries(now()).await.unwrap();
        assert_eq!(early.attempted(), 0);

        let later = pipeline
            .run_due_retries(now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(later.sent, 1);
        let delivery = repo.find_delivery(assignment.id).await.unwrap().unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Sent);
        assert_eq!(delivery.attempts, 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_and_records_notice() {
        let repo = LocalRepository::new();
        let assignment = pending(&repo).await;
        let transport = Arc::new(ScriptTransport::failing(10));
        let pipeline = pipeline(&repo, transport.clone());

        pipeline.dispatch(&[assignment.clone()], now()).await.unwrap();
        let mut at = now();
        for _ in 0..5 {
            at += chrono::Duration::hours(1);
            pipeline.run_due_retries(at).await.unwrap();
        }

        let delivery = repo.find_delivery(assignment.id).await.unwrap().unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Abandoned);
        assert_eq!(delivery.attempts, 3);
        assert_eq!(transport.calls(), 3);

        let entries = repo
            .list_ledger_entries(assignment.instructor_id, now())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, LedgerKind::Notice);
    }

    #[tokio::test]
    async fn retry_after_cancel_is_withdrawn() {
        let repo = LocalRepository::new();
        let assignment = pending(&repo).await;
        let transport = Arc::new(ScriptTransport::failing(1));
        let pipeline = pipeline(&repo, transport.clone());

        pipeline.dispatch(&[assignment.clone()], now()).await.unwrap();
        repo.compare_and_set_state(
            assignment.id,
            AssignmentState::Pending,
            AssignmentState::Canceled,
            now(),
        )
        .await
        .unwrap();

        let tally = pipeline
            .run_due_retries(now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(tally.withdrawn, 1);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn unanswered_delivery_is_penalized_once() {
        let repo = LocalRepository::new();
        let assignment = pending(&repo).await;
        let pipeline = pipeline(&repo, Arc::new(ScriptTransport::default()));
        pipeline.dispatch(&[assignment.clone()], now()).await.unwrap();

        let soon = now() + chrono::Duration::hours(1);
        assert!(pipeline.sweep_response_timeouts(soon).await.unwrap().is_empty());

        let late = now() + chrono::Duration::hours(73);
        assert_eq!(
            pipeline.sweep_response_timeouts(late).await.unwrap(),
            vec![assignment.id]
        );
        assert!(pipeline.sweep_response_timeouts(late).await.unwrap().is_empty());

        let ledger = FairnessLedger::new(Arc::new(repo.clone()), FairnessSettings::default());
        assert_eq!(ledger.score(assignment.instructor_id, late).await.unwrap(), -5);
    }

    #[tokio::test]
    async fn scheduler_stops_on_shutdown() {
        let repo = LocalRepository::new();
        let pipeline = Arc::new(pipeline(&repo, Arc::new(ScriptTransport::default())));
        let (tx, rx) = watch::channel(false);
        let handle = RetryScheduler::spawn(pipeline, Duration::from_millis(5), rx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
