//! Units, their derived training calendar, and their training locations.

use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use super::{LocationId, Place, ScheduleId, UnitId};

/// Daily time window (work hours, lunch break).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

/// Person at the unit who receives the instructors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactOfficer {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

/// A client site that hosts training sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Assigned by the repository; `None` before first store.
    pub id: Option<UnitId>,
    pub name: String,
    pub region: String,
    pub place: Place,
    pub education_start: NaiveDate,
    pub education_end: NaiveDate,
    /// Dates inside the window on which no education is held.
    #[serde(default)]
    pub excluded_dates: BTreeSet<NaiveDate>,
    pub work_hours: Option<TimeWindow>,
    pub lunch_hours: Option<TimeWindow>,
    pub officer: Option<ContactOfficer>,
}

impl Unit {
    /// Every date in `[education_start, education_end]` that is not excluded,
    /// ascending. An inverted window yields nothing.
    pub fn effective_dates(&self) -> Vec<NaiveDate> {
        if self.education_start > self.education_end {
            return Vec::new();
        }
        self.education_start
            .iter_days()
            .take_while(|d| *d <= self.education_end)
            .filter(|d| !self.excluded_dates.contains(d))
            .collect()
    }
}

/// One calendar date on which a unit holds training.
///
/// Derived from the unit's window and exclusions, never authored directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSchedule {
    pub id: ScheduleId,
    pub unit_id: UnitId,
    pub date: NaiveDate,
}

/// A physical sub-site of a unit with its own instructor headcount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingLocation {
    pub id: Option<LocationId>,
    pub unit_id: UnitId,
    pub place: Place,
    /// Required instructor headcount.
    pub instructors_required: u32,
    pub planned_count: Option<u32>,
    pub actual_count: Option<u32>,
}

/// Headcount a unit needs on each of its schedule dates.
pub fn total_demand(locations: &[TrainingLocation]) -> u32 {
    locations.iter().map(|l| l.instructors_required).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn unit(start: &str, end: &str, excluded: &[&str]) -> Unit {
        Unit {
            id: None,
            name: "North Depot".into(),
            region: "north".into(),
            place: Place::new("1 Depot Road"),
            education_start: date(start),
            education_end: date(end),
            excluded_dates: excluded.iter().map(|d| date(d)).collect(),
            work_hours: None,
            lunch_hours: None,
            officer: None,
        }
    }

    #[test]
    fn effective_dates_skip_exclusions() {
        let u = unit("2025-05-09", "2025-05-12", &["2025-05-10"]);
        assert_eq!(
            u.effective_dates(),
            vec![date("2025-05-09"), date("2025-05-11"), date("2025-05-12")]
        );
    }

    #[test]
    fn single_day_window() {
        let u = unit("2025-05-10", "2025-05-10", &[]);
        assert_eq!(u.effective_dates(), vec![date("2025-05-10")]);
    }

    #[test]
    fn inverted_window_is_empty() {
        let u = unit("2025-05-12", "2025-05-10", &[]);
        assert!(u.effective_dates().is_empty());
    }

    #[test]
    fn exclusions_outside_window_are_ignored() {
        let u = unit("2025-05-10", "2025-05-11", &["2025-06-01"]);
        assert_eq!(u.effective_dates().len(), 2);
    }

    #[test]
    fn demand_sums_locations() {
        let loc = |n| TrainingLocation {
            id: None,
            unit_id: UnitId(1),
            place: Place::new("hall"),
            instructors_required: n,
            planned_count: None,
            actual_count: None,
        };
        assert_eq!(total_demand(&[loc(2), loc(3), loc(0)]), 5);
        assert_eq!(total_demand(&[]), 0);
    }

    #[test]
    fn time_window_display() {
        let w = TimeWindow::new(
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(17, 30, 0).unwrap(),
        );
        assert_eq!(w.to_string(), "09:00-17:30");
    }
}
