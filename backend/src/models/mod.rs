//! Domain model for instructor deployment.
//!
//! Units publish training dates and locations, instructors declare the dates
//! they can work, and the engine binds the two together through assignments.
//! Everything here is plain data; behaviour lives in [`crate::services`].

pub mod assignment;
pub mod dispatch;
pub mod instructor;
pub mod ledger;
pub mod macros;
pub mod unit;

pub use assignment::*;
pub use dispatch::*;
pub use instructor::*;
pub use ledger::*;
pub use unit::*;

crate::define_id_type!(i64, UnitId, "unit");
crate::define_id_type!(i64, ScheduleId, "schedule");
crate::define_id_type!(i64, LocationId, "location");
crate::define_id_type!(i64, InstructorId, "instructor");
crate::define_id_type!(i64, AssignmentId, "assignment");
crate::define_id_type!(i64, DispatchId, "dispatch");

/// A street address with optional coordinates.
///
/// The distance resolver prefers coordinates when both sides have them.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Place {
    pub address: String,
    #[serde(default)]
    pub coordinates: Option<GeoPoint>,
}

impl Place {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            coordinates: None,
        }
    }

    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.coordinates = Some(GeoPoint {
            latitude,
            longitude,
        });
        self
    }
}

/// WGS84 latitude/longitude in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_display_carries_tag() {
        assert_eq!(UnitId::new(3).to_string(), "unit#3");
        assert_eq!(InstructorId::from(12).to_string(), "instructor#12");
    }

    #[test]
    fn id_ordering_follows_inner_value() {
        let mut ids = vec![InstructorId(5), InstructorId(1), InstructorId(3)];
        ids.sort();
        assert_eq!(ids, vec![InstructorId(1), InstructorId(3), InstructorId(5)]);
        assert_eq!(i64::from(ids[0]), 1);
    }

    #[test]
    fn id_serializes_as_bare_integer() {
        let json = serde_json::to_string(&AssignmentId(42)).unwrap();
        assert_eq!(json, "42");
    }
}
