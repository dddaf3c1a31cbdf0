//! Engine facade.
//!
//! [`Engine`] wires the services together over one repository and exposes
//! the operations callers actually trigger: matching runs, instructor
//! decisions, administrative cancel and reset, and notification dispatch.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db::repository::{AssignmentRepository, FullRepository, RosterRepository};
use crate::db::{reservation_fingerprint, RepositoryFactory};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    Assignment, AssignmentId, AssignmentState, Decision, DispatchId, InstructorId,
};
use crate::services::{
    AssignmentLifecycle, DeliveryTally, DispatchPipeline, DispatchReport, DistanceEligibility,
    DistanceResolver, FairnessLedger, LogLevel, MatchingEngine, NotificationTransport,
    RetryScheduler, RunContext, RunKind, RunTracker, Shortfall,
};

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// What one matching run did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingSummary {
    pub run_id: Uuid,
    pub assignments_created: usize,
    pub assignments: Vec<Assignment>,
    pub unmet_demand: Vec<Shortfall>,
    pub errors: Vec<String>,
    /// Stable hash of the created reservations; equal inputs give equal values.
    pub fingerprint: String,
    /// Dispatch that carried the notifications, if any were sent.
    pub dispatch_id: Option<DispatchId>,
}

pub struct Engine {
    repo: Arc<dyn FullRepository>,
    config: EngineConfig,
    matching: MatchingEngine,
    lifecycle: AssignmentLifecycle,
    ledger: FairnessLedger,
    pipeline: Arc<DispatchPipeline>,
    tracker: RunTracker,
    run_lock: Mutex<()>,
    clock: Clock,
}

impl Engine {
    pub fn new(
        repo: Arc<dyn FullRepository>,
        resolver: Arc<dyn DistanceResolver>,
        transport: Arc<dyn NotificationTransport>,
        config: EngineConfig,
    ) -> Self {
        let tracker = RunTracker::new();
        let ledger = FairnessLedger::new(repo.clone(), config.fairness.clone());
        let distance = DistanceEligibility::new(repo.clone(), resolver, config.distance.clone());
        let matching = MatchingEngine::new(
            repo.clone(),
            distance,
            ledger.clone(),
            config.matching.role_policy,
        );
        let lifecycle = AssignmentLifecycle::new(repo.clone(), ledger.clone());
        let pipeline = Arc::new(DispatchPipeline::new(
            repo.clone(),
            transport,
            ledger.clone(),
            config.dispatch.clone(),
            tracker.clone(),
        ));
        Self {
            repo,
            config,
            matching,
            lifecycle,
            ledger,
            pipeline,
            tracker,
            run_lock: Mutex::new(()),
            clock: Arc::new(Utc::now),
        }
    }

    /// Build an engine over the repository named in `config`.
    pub fn from_config(
        config: EngineConfig,
        resolver: Arc<dyn DistanceResolver>,
        transport: Arc<dyn NotificationTransport>,
    ) -> EngineResult<Self> {
        let repo = RepositoryFactory::from_config(&config)?;
        Ok(Self::new(repo, resolver, transport, config))
    }

    /// Replace the wall clock, e.g. with a fixed instant in tests.
    pub fn with_clock(
        mut self,
        clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static,
    ) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn repository(&self) -> &Arc<dyn FullRepository> {
        &self.repo
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    pub async fn health_check(&self) -> EngineResult<bool> {
        Ok(self.repo.health_check().await?)
    }

    pub async fn fairness_score(&self, instructor_id: InstructorId) -> EngineResult<i64> {
        self.ledger.score(instructor_id, self.now()).await
    }

    /// Match every unit's open demand and notify the new assignees.
    ///
    /// Only one run may be in progress; a concurrent call fails with
    /// [`EngineError::RunInProgress`]. Reservations are committed as one
    /// batch. Notification happens after the run lock is released, and a
    /// dispatch failure is reported in `errors` rather than failing the run.
    pub async fn run_matching(&self) -> EngineResult<MatchingSummary> {
        let now = self.now();
        let run_id = Uuid::new_v4();
        let mut summary = {
            let _guard = self
                .run_lock
                .try_lock()
                .map_err(|_| EngineError::RunInProgress)?;
            self.tracker.start_run_with_id(run_id, RunKind::Matching);
            match self.match_and_commit(run_id, now).await {
                Ok(summary) => summary,
                Err(err) => {
                    self.tracker.fail_run(run_id, err.to_string());
                    return Err(err);
                }
            }
        };

        if !summary.assignments.is_empty() {
            match self.pipeline.dispatch(&summary.assignments, now).await {
                Ok(report) => summary.dispatch_id = report.dispatch.map(|d| d.id),
                Err(err) => {
                    warn!(%run_id, error = %err, "dispatch after matching failed");
                    self.tracker
                        .log(run_id, LogLevel::Warning, format!("dispatch failed: {}", err));
                    summary.errors.push(format!("dispatch failed: {}", err));
                }
            }
        }

        self.tracker
            .complete_run(run_id, serde_json::to_value(&summary).ok());
        Ok(summary)
    }

    async fn match_and_commit(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> EngineResult<MatchingSummary> {
        let units = self.repo.list_units().await?;
        self.tracker.log(
            run_id,
            LogLevel::Info,
            format!("matching {} units", units.len()),
        );

        let ctx = RunContext::new(run_id);
        let (plan, created) = self.matching.run(&units, &ctx, now).await?;

        let level = if plan.unmet_demand.is_empty() {
            LogLevel::Success
        } else {
            LogLevel::Warning
        };
        self.tracker.log(
            run_id,
            level,
            format!(
                "{} assignments created, {} slots short",
                created.len(),
                plan.unmet_demand.len()
            ),
        );
        for error in &plan.errors {
            self.tracker.log(run_id, LogLevel::Warning, error.clone());
        }
        info!(%run_id, created = created.len(), "matching run finished");

        Ok(MatchingSummary {
            run_id,
            assignments_created: created.len(),
            fingerprint: reservation_fingerprint(&plan.reservations),
            assignments: created,
            unmet_demand: plan.unmet_demand,
            errors: plan.errors,
            dispatch_id: None,
        })
    }

    /// Record an instructor's answer to a pending assignment.
    pub async fn decide_assignment(
        &self,
        assignment_id: AssignmentId,
        decision: Decision,
    ) -> EngineResult<Assignment> {
        self.lifecycle.decide(assignment_id, decision, self.now()).await
    }

    /// Administrative cancel. The freed slot is filled by a later run, not
    /// by this call.
    pub async fn cancel_assignment(
        &self,
        assignment_id: AssignmentId,
    ) -> EngineResult<Assignment> {
        self.lifecycle.cancel(assignment_id, self.now()).await
    }

    /// Credit the instructor of an accepted assignment whose date has passed.
    pub async fn complete_assignment(
        &self,
        assignment_id: AssignmentId,
    ) -> EngineResult<Assignment> {
        self.lifecycle.complete(assignment_id, self.now()).await
    }

    pub async fn dispatch(&self, assignments: &[Assignment]) -> EngineResult<DispatchReport> {
        self.pipeline.dispatch(assignments, self.now()).await
    }

    /// Dispatch every pending assignment that has no live delivery, such as
    /// those whose earlier delivery was abandoned.
    pub async fn dispatch_pending(&self) -> EngineResult<DispatchReport> {
        let pending: Vec<Assignment> = self
            .repo
            .list_assignments()
            .await?
            .into_iter()
            .filter(|a| a.state == AssignmentState::Pending)
            .collect();
        self.dispatch(&pending).await
    }

    pub async fn run_due_retries(&self) -> EngineResult<DeliveryTally> {
        self.pipeline.run_due_retries(self.now()).await
    }

    pub async fn sweep_response_timeouts(&self) -> EngineResult<Vec<AssignmentId>> {
        self.pipeline.sweep_response_timeouts(self.now()).await
    }

    /// Remove every assignment and delivery record. Fails while a matching
    /// run holds the lock.
    pub async fn reset_assignments(&self) -> EngineResult<usize> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| EngineError::RunInProgress)?;
        let removed = self.repo.clear_assignments().await?;
        warn!(removed, "assignments reset");
        Ok(removed)
    }

    /// Drive retries and the response-timeout sweep in the background
    /// until `shutdown` becomes `true`.
    pub fn spawn_retry_scheduler(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        RetryScheduler::spawn(
            self.pipeline.clone(),
            self.config.dispatch.retry_poll_interval(),
            shutdown,
        )
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}
