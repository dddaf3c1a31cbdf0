//! Shared fixtures and collaborator doubles for the integration tests.

#![allow(dead_code)]

mod yielding;

pub use yielding::YieldingRepository;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;

use instructor_dispatch::config::EngineConfig;
use instructor_dispatch::db::repositories::LocalRepository;
use instructor_dispatch::db::repository::{
    AssignmentRepository, FullRepository, LedgerRepository, RosterRepository,
};
use instructor_dispatch::models::{
    Assignment, Contact, Instructor, InstructorId, LedgerEntry, LedgerKind, NewAssignment, Place,
    Role, TrainingLocation, Unit, UnitId,
};
use instructor_dispatch::services::{
    DistanceResolver, HaversineResolver, NotificationMessage, NotificationTransport,
    ResolveError, Route, TransportError,
};
use instructor_dispatch::Engine;

/// Unit headquarters used by most fixtures.
pub const BASE: (f64, f64) = (59.91, 10.75);
/// A couple of kilometres from `BASE`.
pub const NEAR: (f64, f64) = (59.92, 10.76);
/// Several hundred kilometres from `BASE`.
pub const FAR: (f64, f64) = (63.43, 10.39);

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap()
}

/// Manually advanced clock shared with an [`Engine`].
#[derive(Clone)]
pub struct TestClock(Arc<Mutex<DateTime<Utc>>>);

impl TestClock {
    pub fn at(start: DateTime<Utc>) -> Self {
        Self(Arc::new(Mutex::new(start)))
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.0.lock() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.0.lock() = to;
    }
}

/// A seeded in-memory repository.
#[derive(Clone, Default)]
pub struct World {
    pub repo: LocalRepository,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> Arc<dyn FullRepository> {
        Arc::new(self.repo.clone())
    }

    /// Store a unit at `at` training every day from `start` to `end` with a
    /// single location needing `demand` instructors.
    pub async fn unit(
        &self,
        name: &str,
        at: (f64, f64),
        start: &str,
        end: &str,
        demand: u32,
    ) -> Unit {
        let unit = self
            .repo
            .store_unit(&Unit {
                id: None,
                name: name.to_string(),
                region: "test".to_string(),
                place: Place::new(format!("{name} HQ")).with_coordinates(at.0, at.1),
                education_start: date(start),
                education_end: date(end),
                excluded_dates: Default::default(),
                work_hours: None,
                lunch_hours: None,
                officer: None,
            })
            .await
            .unwrap();
        if demand > 0 {
            self.repo
                .store_location(&TrainingLocation {
                    id: None,
                    unit_id: unit.id.unwrap(),
                    place: Place::new(format!("{name} hall")),
                    instructors_required: demand,
                    planned_count: None,
                    actual_count: None,
                })
                .await
                .unwrap();
        }
        unit
    }

    /// Store an instructor living at `at`, available on `dates`.
    pub async fn instructor(&self, name: &str, at: (f64, f64), dates: &[&str]) -> InstructorId {
        let id = self
            .repo
            .store_instructor(&Instructor {
                id: None,
                name: name.to_string(),
                team: None,
                place: Place::new(format!("{name} home")).with_coordinates(at.0, at.1),
                contact: Contact {
                    email: Some(email(name)),
                    phone: None,
                },
                profile_complete: true,
            })
            .await
            .unwrap()
            .id
            .unwrap();
        for d in dates {
            self.repo.declare_availability(id, date(d)).await.unwrap();
        }
        id
    }

    /// Give an instructor a starting fairness score.
    pub async fn credit(&self, id: InstructorId, magnitude: i64) {
        self.repo
            .append_ledger_entry(&LedgerEntry {
                instructor_id: id,
                kind: LedgerKind::Credit,
                magnitude,
                reason: "seed".to_string(),
                recorded_at: t0() - chrono::Duration::days(1),
            })
            .await
            .unwrap();
    }

    /// Commit a `Pending` assignment of `instructor_id` to the first training
    /// day of `unit_id`, bypassing matching.
    pub async fn reserve(&self, unit_id: UnitId, instructor_id: InstructorId) -> Assignment {
        let schedule = self.repo.list_schedules(unit_id).await.unwrap().remove(0);
        self.repo
            .commit_assignments(
                &[NewAssignment {
                    instructor_id,
                    unit_id,
                    schedule_id: schedule.id,
                    date: schedule.date,
                    role: Role::Main,
                    run_id: uuid::Uuid::nil(),
                }],
                t0(),
            )
            .await
            .unwrap()
            .remove(0)
    }

    /// Engine over a [`YieldingRepository`] wrapping this world's storage.
    pub fn yielding_engine(
        &self,
        transport: Arc<dyn NotificationTransport>,
        config: EngineConfig,
        clock: &TestClock,
    ) -> (Engine, YieldingRepository) {
        let repo = YieldingRepository::over(self.repo.clone());
        let clock = clock.clone();
        let engine = Engine::new(
            Arc::new(repo.clone()),
            Arc::new(HaversineResolver::default()),
            transport,
            config,
        )
        .with_clock(move || clock.now());
        (engine, repo)
    }

    pub fn engine(
        &self,
        resolver: Arc<dyn DistanceResolver>,
        transport: Arc<dyn NotificationTransport>,
        config: EngineConfig,
        clock: &TestClock,
    ) -> Engine {
        let clock = clock.clone();
        Engine::new(self.shared(), resolver, transport, config).with_clock(move || clock.now())
    }

    /// Engine with the haversine resolver, a recording transport, default
    /// configuration and a clock at [`t0`].
    pub fn default_engine(&self) -> (Engine, Arc<RecordingTransport>, TestClock) {
        let transport = Arc::new(RecordingTransport::default());
        let clock = TestClock::at(t0());
        let engine = self.engine(
            Arc::new(HaversineResolver::default()),
            transport.clone(),
            EngineConfig::default(),
            &clock,
        );
        (engine, transport, clock)
    }
}

pub fn email(name: &str) -> String {
    format!("{}@example.org", name.to_lowercase())
}

/// Resolver with per-origin scripted answers; anything unscripted falls
/// back to great-circle distance.
#[derive(Default)]
pub struct ScriptedResolver {
    answers: Mutex<HashMap<String, Result<Route, ResolveError>>>,
    delay: Option<Duration>,
    calls: Mutex<usize>,
}

impl ScriptedResolver {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Script the answer for routes starting at `origin_address`.
    pub fn answer(&self, origin_address: &str, answer: Result<Route, ResolveError>) {
        self.answers
            .lock()
            .insert(origin_address.to_string(), answer);
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl DistanceResolver for ScriptedResolver {
    async fn resolve(&self, origin: &Place, destination: &Place) -> Result<Route, ResolveError> {
        *self.calls.lock() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.answers.lock().get(&origin.address).cloned();
        match scripted {
            Some(answer) => answer,
            None => HaversineResolver::default().resolve(origin, destination).await,
        }
    }
}

/// Transport that records every successful send and fails on request.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, String)>>,
    failures: Mutex<HashMap<String, VecDeque<TransportError>>>,
    hangs: Mutex<HashMap<String, usize>>,
    calls: Mutex<usize>,
}

impl RecordingTransport {
    /// Fail the next `times` sends to `recipient` with `error`.
    pub fn fail_next(&self, recipient: &str, times: usize, error: TransportError) {
        let mut failures = self.failures.lock();
        let queue = failures.entry(recipient.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Never answer the next `times` sends to `recipient`.
    pub fn hang_next(&self, recipient: &str, times: usize) {
        *self.hangs.lock().entry(recipient.to_string()).or_default() += times;
    }

    /// `(recipient, subject)` of every delivered message, in send order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, recipient: &str) -> usize {
        self.sent.lock().iter().filter(|(r, _)| r == recipient).count()
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn send(
        &self,
        contact: &Contact,
        message: &NotificationMessage,
    ) -> Result<(), TransportError> {
        *self.calls.lock() += 1;
        let recipient = contact
            .email
            .clone()
            .ok_or_else(|| TransportError::Rejected("no email".into()))?;
        let hang = match self.hangs.lock().get_mut(&recipient) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(error) = self
            .failures
            .lock()
            .get_mut(&recipient)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        self.sent.lock().push((recipient, message.subject.clone()));
        Ok(())
    }
}
