//! Ledger repository: fairness events and memoized distances.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::RepositoryResult;
use crate::models::{DistanceRecord, InstructorId, LedgerEntry, UnitId};

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Cached distance for the (instructor, unit) pair, if any.
    async fn get_distance(
        &self,
        instructor_id: InstructorId,
        unit_id: UnitId,
    ) -> RepositoryResult<Option<DistanceRecord>>;

    /// Insert or replace the cache entry keyed by (instructor, unit).
    async fn upsert_distance(&self, record: &DistanceRecord) -> RepositoryResult<()>;

    /// Append a fairness event. Entries are never updated or removed.
    async fn append_ledger_entry(&self, entry: &LedgerEntry) -> RepositoryResult<()>;

    /// Append `entry` unless the instructor already has an entry of the same
    /// kind and reason, at any age. Check and append are one write.
    ///
    /// # Returns
    /// `true` if the entry was appended.
    async fn append_ledger_entry_once(&self, entry: &LedgerEntry) -> RepositoryResult<bool>;

    /// Entries for an instructor recorded at or after `since`, oldest first.
    async fn list_ledger_entries(
        &self,
        instructor_id: InstructorId,
        since: DateTime<Utc>,
    ) -> RepositoryResult<Vec<LedgerEntry>>;
}
