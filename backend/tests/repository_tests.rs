//! Repository factory and in-memory backend behaviour seen from outside
//! the crate.

mod support;

use std::io::Write;

use chrono::Duration;

use instructor_dispatch::config::EngineConfig;
use instructor_dispatch::db::repository::{
    DispatchRepository, LedgerRepository, RepositoryError, RosterRepository,
};
use instructor_dispatch::db::{RepositoryFactory, RepositoryType};
use instructor_dispatch::models::{
    DeliveryStatus, DistanceRecord, LedgerEntry, LedgerKind, UnitId,
};
use support::*;

#[test]
fn test_repository_type_names() {
    assert_eq!("LOCAL".parse::<RepositoryType>().unwrap(), RepositoryType::Local);
    assert!("postgres".parse::<RepositoryType>().is_err());
}

#[tokio::test]
async fn test_factory_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[repository]\ntype = \"memory\"\n\n[dispatch]\nmax_attempts = 2").unwrap();

    let config = EngineConfig::from_file(file.path()).unwrap();
    assert_eq!(config.dispatch.max_attempts, 2);
    let repo = RepositoryFactory::from_config(&config).unwrap();
    assert!(repo.health_check().await.unwrap());
    assert!(repo.list_units().await.unwrap().is_empty());
}

#[test]
fn test_missing_config_file() {
    let err = EngineConfig::from_file("/nonexistent/engine.toml").unwrap_err();
    assert!(matches!(err, RepositoryError::Configuration { .. }));
}

#[tokio::test]
async fn test_schedules_skip_excluded_dates() {
    let world = World::new();
    let mut unit = world.unit("Orsta", BASE, "2025-06-02", "2025-06-06", 1).await;
    let unit_id = unit.id.unwrap();
    let before = world.repo.list_schedules(unit_id).await.unwrap();
    assert_eq!(before.len(), 5);

    unit.excluded_dates.insert(date("2025-06-04"));
    world.repo.store_unit(&unit).await.unwrap();
    let after: Vec<_> = world
        .repo
        .list_schedules(unit_id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.date)
        .collect();
    assert_eq!(
        after,
        vec![
            date("2025-06-02"),
            date("2025-06-03"),
            date("2025-06-05"),
            date("2025-06-06")
        ]
    );
}

#[tokio::test]
async fn test_unknown_unit_is_not_found() {
    let world = World::new();
    let err = world.repo.get_unit(UnitId(77)).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_distance_cache_is_keyed_by_pair() {
    let world = World::new();
    let unit = world.unit("Floro", BASE, "2025-06-02", "2025-06-02", 1).await;
    let unit_id = unit.id.unwrap();
    let ina = world.instructor("Ina", NEAR, &[]).await;

    let mut record = DistanceRecord {
        instructor_id: ina,
        unit_id,
        distance_meters: 1_200,
        duration_seconds: 180,
        resolved_at: t0(),
    };
    world.repo.upsert_distance(&record).await.unwrap();
    record.distance_meters = 1_500;
    world.repo.upsert_distance(&record).await.unwrap();

    let cached = world.repo.get_distance(ina, unit_id).await.unwrap().unwrap();
    assert_eq!(cached.distance_meters, 1_500);
    assert!(world
        .repo
        .get_distance(ina, UnitId(unit_id.value() + 1))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_ledger_entries_since_cutoff_oldest_first() {
    let world = World::new();
    let ina = world.instructor("Ina", NEAR, &[]).await;
    for (days_ago, magnitude) in [(400, 9), (30, 2), (1, 3)] {
        world
            .repo
            .append_ledger_entry(&LedgerEntry {
                instructor_id: ina,
                kind: LedgerKind::Credit,
                magnitude,
                reason: format!("credit {days_ago}"),
                recorded_at: t0() - Duration::days(days_ago),
            })
            .await
            .unwrap();
    }

    let recent = world
        .repo
        .list_ledger_entries(ina, t0() - Duration::days(365))
        .await
        .unwrap();
    let magnitudes: Vec<i64> = recent.iter().map(|e| e.magnitude).collect();
    assert_eq!(magnitudes, vec![2, 3]);
}

#[tokio::test]
async fn test_delivery_queries_follow_status_and_time() {
    let world = World::new();
    world.unit("Sogndal", BASE, "2025-06-02", "2025-06-02", 2).await;
    world.instructor("Ina", NEAR, &["2025-06-02"]).await;
    world.instructor("Ola", NEAR, &["2025-06-02"]).await;
    let (engine, _transport, _clock) = world.default_engine();
    let summary = engine.run_matching().await.unwrap();
    let dispatch_id = summary.dispatch_id.unwrap();

    let mut deliveries = world.repo.list_deliveries(dispatch_id).await.unwrap();
    assert_eq!(deliveries.len(), 2);
    let mut failed = deliveries.remove(0);
    failed.status = DeliveryStatus::Failed;
    failed.next_attempt_at = Some(t0() + Duration::minutes(10));
    world.repo.update_delivery(&failed).await.unwrap();

    let orphan_after = Duration::hours(1);
    assert!(world
        .repo
        .list_due_retries(t0(), orphan_after)
        .await
        .unwrap()
        .is_empty());
    let due = world
        .repo
        .list_due_retries(t0() + Duration::minutes(10), orphan_after)
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].assignment_id, failed.assignment_id);

    let unanswered = world.repo.list_unanswered(t0()).await.unwrap();
    assert_eq!(unanswered.len(), 1);
    assert_eq!(unanswered[0].assignment_id, deliveries[0].assignment_id);
    assert!(world
        .repo
        .list_unanswered(t0() - Duration::seconds(1))
        .await
        .unwrap()
        .is_empty());

    let answered = &unanswered[0];
    assert!(world
        .repo
        .mark_penalized(answered.dispatch_id, answered.assignment_id)
        .await
        .unwrap());
    assert!(!world
        .repo
        .mark_penalized(answered.dispatch_id, answered.assignment_id)
        .await
        .unwrap());
    assert!(world.repo.list_unanswered(t0()).await.unwrap().is_empty());
    // Only delivered tasks can be flagged.
    assert!(!world
        .repo
        .mark_penalized(failed.dispatch_id, failed.assignment_id)
        .await
        .unwrap());
}
