//! Seeded matching run against the in-memory repository.
//!
//! Creates two units and a handful of instructors, runs matching once,
//! lets one instructor reject, and runs again to refill the freed slot.
//!
//! ```bash
//! RUST_LOG=debug cargo run --example seeded_run
//! ```
//!
//! An `engine.toml` in the working directory is picked up if present.

use std::env;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use instructor_dispatch::config::{EngineConfig, RolePolicy};
use instructor_dispatch::db::repository::RosterRepository;
use instructor_dispatch::db::LocalRepository;
use instructor_dispatch::models::{
    Contact, ContactOfficer, Decision, Instructor, Place, TimeWindow, TrainingLocation, Unit,
};
use instructor_dispatch::services::{HaversineResolver, LogTransport, RunKind};
use instructor_dispatch::Engine;

fn day(d: u32) -> anyhow::Result<NaiveDate> {
    NaiveDate::from_ymd_opt(2025, 6, d).ok_or_else(|| anyhow::anyhow!("bad day {d}"))
}

fn hours(from: u32, to: u32) -> Option<TimeWindow> {
    Some(TimeWindow::new(
        NaiveTime::from_hms_opt(from, 0, 0)?,
        NaiveTime::from_hms_opt(to, 0, 0)?,
    ))
}

async fn seed(repo: &LocalRepository) -> anyhow::Result<()> {
    let units = [("Stavanger", 58.97, 5.73, 2), ("Sandnes", 58.85, 5.74, 1)];
    for (name, lat, lon, demand) in units {
        let unit = repo
            .store_unit(&Unit {
                id: None,
                name: name.to_string(),
                region: "Rogaland".to_string(),
                place: Place::new(format!("{name} garrison")).with_coordinates(lat, lon),
                education_start: day(2)?,
                education_end: day(4)?,
                excluded_dates: [day(3)?].into_iter().collect(),
                work_hours: hours(8, 16),
                lunch_hours: hours(11, 12),
                officer: Some(ContactOfficer {
                    name: format!("{name} duty officer"),
                    phone: Some("+47 51 00 00 00".to_string()),
                    email: None,
                }),
            })
            .await?;
        let unit_id = unit
            .id
            .ok_or_else(|| anyhow::anyhow!("unit stored without id"))?;
        repo.store_location(&TrainingLocation {
            id: None,
            unit_id,
            place: Place::new(format!("{name} drill hall")),
            instructors_required: demand,
            planned_count: Some(40),
            actual_count: None,
        })
        .await?;
    }

    let instructors = [
        ("Astrid", 58.96, 5.72, true),
        ("Bjorn", 58.90, 5.70, true),
        ("Camilla", 58.86, 5.75, true),
        ("Dag", 60.39, 5.32, true),
        ("Eirik", 58.97, 5.74, false),
    ];
    for (name, lat, lon, complete) in instructors {
        let stored = repo
            .store_instructor(&Instructor {
                id: None,
                name: name.to_string(),
                team: Some("west".to_string()),
                place: Place::new(format!("{name}'s home")).with_coordinates(lat, lon),
                contact: Contact {
                    email: Some(format!("{}@instructors.example", name.to_lowercase())),
                    phone: None,
                },
                profile_complete: complete,
            })
            .await?;
        let id = stored
            .id
            .ok_or_else(|| anyhow::anyhow!("instructor stored without id"))?;
        for d in [2, 3, 4] {
            repo.declare_availability(id, day(d)?).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_max_level(
            env::var("RUST_LOG")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Level::INFO),
        )
        .with_target(true)
        .init();

    let mut config = EngineConfig::from_default_location().unwrap_or_else(|err| {
        warn!("{}; using defaults", err);
        EngineConfig::default()
    });
    config.matching.role_policy = RolePolicy::LeadThenAssistant;

    let repo = LocalRepository::new();
    seed(&repo).await?;

    let engine = Engine::new(
        Arc::new(repo.clone()),
        Arc::new(HaversineResolver::default()),
        Arc::new(LogTransport),
        config,
    );

    let first = engine.run_matching().await?;
    info!(
        created = first.assignments_created,
        short = first.unmet_demand.len(),
        fingerprint = %first.fingerprint,
        "first run"
    );
    for assignment in &first.assignments {
        println!(
            "{} {} {} {} ({})",
            assignment.id,
            assignment.date,
            assignment.unit_id,
            assignment.instructor_id,
            assignment.role
        );
    }
    for short in &first.unmet_demand {
        println!("short: {} on {} by {}", short.unit_id, short.date, short.shortfall);
    }

    if let Some(assignment) = first.assignments.first() {
        engine
            .decide_assignment(assignment.id, Decision::Reject)
            .await?;
        let second = engine.run_matching().await?;
        info!(created = second.assignments_created, "refill run");
        for assignment in &second.assignments {
            println!(
                "refill: {} {} {}",
                assignment.date, assignment.unit_id, assignment.instructor_id
            );
        }
    }

    let runs = engine.tracker().list_runs(RunKind::Matching);
    println!("{}", serde_json::to_string_pretty(&runs)?);
    Ok(())
}
