//! Persistence boundary for the engine.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Engine facade (engine.rs)                              │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │
//! ┌───────────────────▼─────────────────────────────────────┐
//! │  Services - matching, lifecycle, dispatch, ledger       │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │
//! ┌───────────────────▼─────────────────────────────────────┐
//! │  Repository Traits (repository/) - Abstract Interface   │
//! │  - RosterRepository (units, instructors, availability)  │
//! │  - AssignmentRepository (atomic batches, CAS)           │
//! │  - LedgerRepository (fairness events, distance cache)   │
//! │  - DispatchRepository (dispatch runs, deliveries)       │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │
//!     ┌───────────────▼──────────────────────────────┐
//!     │             Local Repository                  │
//!     │               (in-memory)                     │
//!     └──────────────────────────────────────────────┘
//! ```
//!
//! The storage engine itself is external; [`LocalRepository`] is the
//! reference implementation the engine and its tests run against.

#[cfg(not(feature = "local-repo"))]
compile_error!("Enable at least one repository backend feature.");

pub mod factory;
pub mod fingerprint;
pub mod repositories;
pub mod repository;

pub use factory::{RepositoryFactory, RepositoryType};
pub use fingerprint::reservation_fingerprint;
pub use repositories::LocalRepository;
pub use repository::{
    AssignmentRepository, CasOutcome, DispatchCreation, DispatchRepository, ErrorContext,
    FullRepository,
    LedgerRepository, RepositoryError, RepositoryResult, RosterRepository,
};
