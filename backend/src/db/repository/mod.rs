//! Repository trait definitions for persistence operations.
//!
//! The engine consumes storage through a handful of focused traits rather than
//! one monolithic interface:
//!
//! - [`error`]: Error types for repository operations
//! - [`roster`]: Units, derived schedules, locations, instructors, availability
//! - [`assignment`]: Atomic reservation batches and compare-and-set transitions
//! - [`ledger`]: Fairness ledger events and the distance cache
//! - [`dispatch`]: Notification runs and per-assignment delivery tasks
//!
//! # Convenience Trait Bound
//!
//! For code that needs every capability, use the [`FullRepository`] bound:
//!
//! ```ignore
//! async fn reset<R: FullRepository + ?Sized>(repo: &R) -> RepositoryResult<usize> {
//!     repo.clear_assignments().await
//! }
//! ```

pub mod assignment;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod roster;

pub use error::{ErrorContext, RepositoryError, RepositoryResult};

pub use assignment::{AssignmentRepository, CasOutcome};
pub use dispatch::{DispatchCreation, DispatchRepository};
pub use ledger::LedgerRepository;
pub use roster::RosterRepository;

/// Composite trait bound for a complete repository implementation.
///
/// Automatically implemented for any type implementing all four traits.
pub trait FullRepository:
    RosterRepository + AssignmentRepository + LedgerRepository + DispatchRepository
{
}

impl<T> FullRepository for T where
    T: RosterRepository + AssignmentRepository + LedgerRepository + DispatchRepository
{
}
