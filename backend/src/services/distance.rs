//! Distance eligibility: a read-through cache in front of the route resolver.
//!
//! Lookups check the `(instructor, unit)` cache first and only call the
//! external resolver on a miss or a stale entry. Resolver calls are bounded
//! by a semaphore and a timeout; a failure makes that one instructor
//! ineligible for the current run and never blocks the others.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::DistanceSettings;
use crate::db::repository::{FullRepository, LedgerRepository};
use crate::error::{EngineError, EngineResult};
use crate::models::{DistanceRecord, Instructor, InstructorId, Place, Unit, UnitId};

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Travel distance and time between two places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub distance_meters: u64,
    pub duration_seconds: u64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("cannot resolve route: {0}")]
    Unresolvable(String),
    #[error("resolver rate limit reached")]
    RateLimited,
    #[error("resolver did not answer in time")]
    Timeout,
    #[error("resolver failure: {0}")]
    Upstream(String),
}

impl ResolveError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, ResolveError::Unresolvable(_))
    }
}

/// External geocoding/routing collaborator.
#[async_trait]
pub trait DistanceResolver: Send + Sync {
    async fn resolve(&self, origin: &Place, destination: &Place) -> Result<Route, ResolveError>;
}

/// Offline resolver using great-circle distance between coordinates.
///
/// Fails with [`ResolveError::Unresolvable`] when either place lacks
/// coordinates; address geocoding is left to real resolvers.
#[derive(Debug, Clone)]
pub struct HaversineResolver {
    average_speed_kmh: f64,
}

impl HaversineResolver {
    pub fn new(average_speed_kmh: f64) -> Self {
        Self { average_speed_kmh }
    }

    pub fn great_circle_meters(origin: &Place, destination: &Place) -> Option<f64> {
        let (a, b) = (origin.coordinates?, destination.coordinates?);
        let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (b.longitude - a.longitude).to_radians();
        let h = (dlat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        Some(2.0 * EARTH_RADIUS_METERS * h.sqrt().asin())
    }
}

impl Default for HaversineResolver {
    fn default() -> Self {
        Self::new(60.0)
    }
}

#[async_trait]
impl DistanceResolver for HaversineResolver {
    async fn resolve(&self, origin: &Place, destination: &Place) -> Result<Route, ResolveError> {
        let meters = Self::great_circle_meters(origin, destination).ok_or_else(|| {
            ResolveError::Unresolvable(format!(
                "missing coordinates for '{}' or '{}'",
                origin.address, destination.address
            ))
        })?;
        let meters_per_second = self.average_speed_kmh * 1000.0 / 3600.0;
        let seconds = if meters_per_second > 0.0 {
            meters / meters_per_second
        } else {
            0.0
        };
        Ok(Route {
            distance_meters: meters.round() as u64,
            duration_seconds: seconds.round() as u64,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceSource {
    Cached,
    Resolved,
}

/// Outcome of one eligibility check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub instructor_id: InstructorId,
    pub unit_id: UnitId,
    pub eligible: bool,
    pub distance_meters: u64,
    pub source: DistanceSource,
}

#[derive(Clone)]
pub struct DistanceEligibility {
    repo: Arc<dyn FullRepository>,
    resolver: Arc<dyn DistanceResolver>,
    settings: DistanceSettings,
    limiter: Arc<Semaphore>,
}

impl DistanceEligibility {
    pub fn new(
        repo: Arc<dyn FullRepository>,
        resolver: Arc<dyn DistanceResolver>,
        settings: DistanceSettings,
    ) -> Self {
        let permits = settings.max_concurrent_lookups.max(1);
        Self {
            repo,
            resolver,
            settings,
            limiter: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Decide whether `instructor` is close enough to `unit`.
    ///
    /// # Returns
    /// * `Ok(Eligibility)` - From a fresh cache entry or a new resolution
    /// * `Err(EngineError::DistanceUnavailable)` - Resolver failed or timed out
    pub async fn is_eligible(
        &self,
        instructor: &Instructor,
        unit: &Unit,
        now: DateTime<Utc>,
    ) -> EngineResult<Eligibility> {
        let (instructor_id, unit_id) = match (instructor.id, unit.id) {
            (Some(i), Some(u)) => (i, u),
            _ => {
                return Err(EngineError::DistanceUnavailable {
                    instructor: instructor.id.unwrap_or(InstructorId(0)),
                    unit: unit.id.unwrap_or(UnitId(0)),
                    reason: "record has not been stored".into(),
                })
            }
        };

        if let Some(cached) = self.repo.get_distance(instructor_id, unit_id).await? {
            if now - cached.resolved_at <= self.settings.cache_ttl() {
                return Ok(self.judge(
                    instructor_id,
                    unit_id,
                    cached.distance_meters,
                    DistanceSource::Cached,
                ));
            }
            debug!(%instructor_id, %unit_id, "cached distance is stale");
        }

        let route = self
            .resolve_bounded(&instructor.place, &unit.place)
            .await
            .map_err(|e| EngineError::DistanceUnavailable {
                instructor: instructor_id,
                unit: unit_id,
                reason: e.to_string(),
            })?;

        self.repo
            .upsert_distance(&DistanceRecord {
                instructor_id,
                unit_id,
                distance_meters: route.distance_meters,
                duration_seconds: route.duration_seconds,
                resolved_at: now,
            })
            .await?;

        Ok(self.judge(
            instructor_id,
            unit_id,
            route.distance_meters,
            DistanceSource::Resolved,
        ))
    }

    /// Check every instructor against one unit concurrently.
    ///
    /// Results come back in input order; failures are kept per instructor.
    pub async fn evaluate_all(
        &self,
        unit: &Unit,
        instructors: &[Instructor],
        now: DateTime<Utc>,
    ) -> Vec<EngineResult<Eligibility>> {
        join_all(
            instructors
                .iter()
                .map(|instructor| self.is_eligible(instructor, unit, now)),
        )
        .await
    }

    async fn resolve_bounded(
        &self,
        origin: &Place,
        destination: &Place,
    ) -> Result<Route, ResolveError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| ResolveError::Upstream("lookup limiter closed".into()))?;
        match tokio::time::timeout(
            self.settings.lookup_timeout(),
            self.resolver.resolve(origin, destination),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    origin = %origin.address,
                    destination = %destination.address,
                    "distance lookup timed out"
                );
                Err(ResolveError::Timeout)
            }
        }
    }

    fn judge(
        &self,
        instructor_id: InstructorId,
        unit_id: UnitId,
        distance_meters: u64,
        source: DistanceSource,
    ) -> Eligibility {
        Eligibility {
            instructor_id,
            unit_id,
            eligible: distance_meters <= self.settings.max_distance_meters,
            distance_meters,
            source,
        }
    }
}
