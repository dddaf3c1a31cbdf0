//! Canonical fingerprint of a reservation set.
//!
//! Two matching runs over identical inputs must produce the same
//! fingerprint; comparing fingerprints is the cheap way to check that.

use sha2::{Digest, Sha256};

use crate::models::NewAssignment;

/// SHA-256 over the sorted `(unit, date, instructor, role)` lines of a batch.
///
/// The run id is deliberately left out so that reruns compare equal.
pub fn reservation_fingerprint(batch: &[NewAssignment]) -> String {
    let mut lines: Vec<String> = batch
        .iter()
        .map(|a| {
            format!(
                "{}|{}|{}|{}",
                a.unit_id.value(),
                a.date,
                a.instructor_id.value(),
                a.role
            )
        })
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
