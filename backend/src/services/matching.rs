//! Matching engine: turns open unit demand into a batch of reservations.
//!
//! A run works in two phases. Distance eligibility for every unit is
//! evaluated concurrently, since that is where the slow external lookups
//! happen. Reservation then walks the slots in a fixed order (units by id,
//! dates ascending) against a run-scoped consumed set, so the same inputs
//! always produce the same batch. The batch is committed in one call and is
//! either stored whole or not at all.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RolePolicy;
use crate::db::repository::{AssignmentRepository, FullRepository, RosterRepository};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    total_demand, Assignment, AssignmentState, Instructor, InstructorId, NewAssignment, Role,
    ScheduleId, Unit, UnitId,
};
use crate::services::distance::DistanceEligibility;
use crate::services::fairness::FairnessLedger;
use crate::services::ranking::{rank_candidates, Candidate};

/// State shared by every slot of one matching run.
///
/// The consumed set guarantees an instructor is reserved at most once per
/// date across all units in the run.
pub struct RunContext {
    run_id: Uuid,
    consumed: Mutex<HashMap<NaiveDate, HashSet<InstructorId>>>,
}

impl RunContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            consumed: Mutex::new(HashMap::new()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Claim `instructor_id` for `date`. Returns `false` if already claimed.
    pub fn try_reserve(&self, date: NaiveDate, instructor_id: InstructorId) -> bool {
        self.consumed
            .lock()
            .entry(date)
            .or_default()
            .insert(instructor_id)
    }

    pub fn is_consumed(&self, date: NaiveDate, instructor_id: InstructorId) -> bool {
        self.consumed
            .lock()
            .get(&date)
            .map(|ids| ids.contains(&instructor_id))
            .unwrap_or(false)
    }

    pub fn consumed_on(&self, date: NaiveDate) -> usize {
        self.consumed.lock().get(&date).map(HashSet::len).unwrap_or(0)
    }
}

/// Demand a run could not cover for one (unit, date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortfall {
    pub unit_id: UnitId,
    pub date: NaiveDate,
    pub demand: u32,
    /// Active assignments after this run, earlier runs included.
    pub filled: u32,
    pub shortfall: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchingPlan {
    pub reservations: Vec<NewAssignment>,
    pub unmet_demand: Vec<Shortfall>,
    /// Per-instructor distance failures; the instructor was skipped for that unit.
    pub errors: Vec<String>,
}

struct Slot {
    unit_id: UnitId,
    schedule_id: ScheduleId,
    date: NaiveDate,
    demand: u32,
}

#[derive(Default, Clone, Copy)]
struct Occupancy {
    active: u32,
    has_lead: bool,
}

#[derive(Clone, Copy)]
struct Verdict {
    eligible: bool,
    distance_meters: Option<u64>,
}

impl Verdict {
    const UNKNOWN: Verdict = Verdict {
        eligible: false,
        distance_meters: None,
    };
}

#[derive(Clone)]
pub struct MatchingEngine {
    repo: Arc<dyn FullRepository>,
    distance: DistanceEligibility,
    ledger: FairnessLedger,
    role_policy: RolePolicy,
}

impl MatchingEngine {
    pub fn new(
        repo: Arc<dyn FullRepository>,
        distance: DistanceEligibility,
        ledger: FairnessLedger,
        role_policy: RolePolicy,
    ) -> Self {
        Self {
            repo,
            distance,
            ledger,
            role_policy,
        }
    }

    /// Compute reservations for `units` without writing any assignment.
    ///
    /// Distance lookups may still populate the distance cache.
    pub async fn plan(
        &self,
        units: &[Unit],
        ctx: &RunContext,
        now: DateTime<Utc>,
    ) -> EngineResult<MatchingPlan> {
        let mut units: Vec<&Unit> = units.iter().filter(|u| u.id.is_some()).collect();
        units.sort_by_key(|u| u.id);

        let mut slots = Vec::new();
        let mut unit_dates: BTreeMap<UnitId, BTreeSet<NaiveDate>> = BTreeMap::new();
        for unit in &units {
            let Some(unit_id) = unit.id else { continue };
            let demand = total_demand(&self.repo.list_locations(unit_id).await?);
            if demand == 0 {
                debug!(%unit_id, "unit has no demand");
                continue;
            }
            for schedule in self.repo.list_schedules(unit_id).await? {
                unit_dates.entry(unit_id).or_default().insert(schedule.date);
                slots.push(Slot {
                    unit_id,
                    schedule_id: schedule.id,
                    date: schedule.date,
                    demand,
                });
            }
        }
        if slots.is_empty() {
            return Ok(MatchingPlan::default());
        }

        // Snapshot availability and existing bookings per date.
        let dates: BTreeSet<NaiveDate> = slots.iter().map(|s| s.date).collect();
        let mut available: HashMap<NaiveDate, Vec<InstructorId>> = HashMap::new();
        let mut booked: HashSet<(NaiveDate, InstructorId)> = HashSet::new();
        let mut occupancy: HashMap<(UnitId, NaiveDate), Occupancy> = HashMap::new();
        for date in &dates {
            available.insert(*date, self.repo.list_available_instructors(*date).await?);
            for existing in self.repo.list_active_assignments_on(*date).await? {
                booked.insert((existing.date, existing.instructor_id));
                let slot = occupancy
                    .entry((existing.unit_id, existing.date))
                    .or_default();
                slot.active += 1;
                slot.has_lead |= existing.role == Role::Lead;
            }
        }

        // An instructor who rejected a slot is not offered it again.
        let declined: HashSet<(UnitId, NaiveDate, InstructorId)> = self
            .repo
            .list_assignments()
            .await?
            .into_iter()
            .filter(|a| a.state == AssignmentState::Rejected && dates.contains(&a.date))
            .map(|a| (a.unit_id, a.date, a.instructor_id))
            .collect();

        let roster: BTreeMap<InstructorId, Instructor> = self
            .repo
            .list_instructors()
            .await?
            .into_iter()
            .filter(|i| i.profile_complete)
            .filter_map(|i| i.id.map(|id| (id, i)))
            .collect();

        // Phase 1: eligibility, concurrently across units.
        let mut pools: Vec<(&Unit, Vec<Instructor>)> = Vec::new();
        for unit in &units {
            let Some(dates) = unit.id.and_then(|id| unit_dates.get(&id)) else {
                continue;
            };
            let ids: BTreeSet<InstructorId> = dates
                .iter()
                .filter_map(|d| available.get(d))
                .flatten()
                .copied()
                .collect();
            let pool = ids.iter().filter_map(|id| roster.get(id).cloned()).collect();
            pools.push((*unit, pool));
        }

        let evaluations = join_all(
            pools
                .iter()
                .map(|(unit, pool)| self.distance.evaluate_all(unit, pool, now)),
        )
        .await;

        let mut verdicts: HashMap<(UnitId, InstructorId), Verdict> = HashMap::new();
        let mut errors = Vec::new();
        for ((unit, pool), results) in pools.iter().zip(evaluations) {
            let Some(unit_id) = unit.id else { continue };
            for (instructor, result) in pool.iter().zip(results) {
                let Some(instructor_id) = instructor.id else { continue };
                let verdict = match result {
                    Ok(e) => Verdict {
                        eligible: e.eligible,
                        distance_meters: Some(e.distance_meters),
                    },
                    Err(err @ EngineError::DistanceUnavailable { .. }) => {
                        warn!(%instructor_id, %unit_id, error = %err, "skipping instructor");
                        errors.push(err.to_string());
                        Verdict::UNKNOWN
                    }
                    Err(err) => return Err(err),
                };
                verdicts.insert((unit_id, instructor_id), verdict);
            }
        }

        let scored: Vec<InstructorId> = roster.keys().copied().collect();
        let scores = self.ledger.scores(&scored, now).await?;

        // Phase 2: reserve in deterministic order.
        let mut plan = MatchingPlan {
            errors,
            ..Default::default()
        };
        for slot in &slots {
            let occupied = occupancy
                .get(&(slot.unit_id, slot.date))
                .copied()
                .unwrap_or_default();
            let remaining = slot.demand.saturating_sub(occupied.active);
            if remaining == 0 {
                continue;
            }

            let candidates: Vec<Candidate> = available
                .get(&slot.date)
                .into_iter()
                .flatten()
                .filter(|id| roster.contains_key(id))
                .filter(|id| !booked.contains(&(slot.date, **id)))
                .filter(|id| !ctx.is_consumed(slot.date, **id))
                .filter(|id| !declined.contains(&(slot.unit_id, slot.date, **id)))
                .map(|id| {
                    let verdict = verdicts
                        .get(&(slot.unit_id, *id))
                        .copied()
                        .unwrap_or(Verdict::UNKNOWN);
                    Candidate {
                        instructor_id: *id,
                        eligible: verdict.eligible,
                        score: scores.get(id).copied().unwrap_or(0),
                        distance_meters: verdict.distance_meters,
                    }
                })
                .collect();

            let mut filled = 0;
            let mut has_lead = occupied.has_lead;
            for candidate in rank_candidates(candidates).iter().filter(|c| c.eligible) {
                if filled == remaining {
                    break;
                }
                if !ctx.try_reserve(slot.date, candidate.instructor_id) {
                    continue;
                }
                plan.reservations.push(NewAssignment {
                    instructor_id: candidate.instructor_id,
                    unit_id: slot.unit_id,
                    schedule_id: slot.schedule_id,
                    date: slot.date,
                    role: self.next_role(&mut has_lead),
                    run_id: ctx.run_id(),
                });
                filled += 1;
            }

            if filled < remaining {
                debug!(
                    unit_id = %slot.unit_id,
                    date = %slot.date,
                    missing = remaining - filled,
                    "demand not fully covered"
                );
                plan.unmet_demand.push(Shortfall {
                    unit_id: slot.unit_id,
                    date: slot.date,
                    demand: slot.demand,
                    filled: occupied.active + filled,
                    shortfall: remaining - filled,
                });
            }
        }

        Ok(plan)
    }

    /// Plan and commit. Nothing is stored if the commit fails.
    pub async fn run(
        &self,
        units: &[Unit],
        ctx: &RunContext,
        now: DateTime<Utc>,
    ) -> EngineResult<(MatchingPlan, Vec<Assignment>)> {
        let plan = self.plan(units, ctx, now).await?;
        if plan.reservations.is_empty() {
            info!(run_id = %ctx.run_id(), "nothing to reserve");
            return Ok((plan, Vec::new()));
        }
        let created = self
            .repo
            .commit_assignments(&plan.reservations, now)
            .await?;
        info!(
            run_id = %ctx.run_id(),
            created = created.len(),
            shortfalls = plan.unmet_demand.len(),
            "reservations committed"
        );
        Ok((plan, created))
    }

    fn next_role(&self, has_lead: &mut bool) -> Role {
        match self.role_policy {
            RolePolicy::AllMain => Role::Main,
            RolePolicy::LeadThenAssistant if *has_lead => Role::Assistant,
            RolePolicy::LeadThenAssistant => {
                *has_lead = true;
                Role::Lead
            }
        }
    }
}
