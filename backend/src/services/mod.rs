//! Service layer for the assignment and dispatch engine.
//!
//! Services sit between the repository traits and the [`crate::engine`]
//! facade. Each one owns a single concern and talks to storage only through
//! [`crate::db::FullRepository`].

pub mod dispatch;
pub mod distance;
pub mod fairness;
pub mod lifecycle;
pub mod matching;
pub mod notifier;
pub mod ranking;
pub mod run_tracker;

pub use dispatch::{DeliveryTally, DispatchPipeline, DispatchReport, RetryScheduler};
pub use distance::{
    DistanceEligibility, DistanceResolver, DistanceSource, Eligibility, HaversineResolver,
    ResolveError, Route,
};
pub use fairness::{CreditReason, FairnessLedger, PenaltyReason};
pub use lifecycle::{AssignmentLifecycle, Transition};
pub use matching::{MatchingEngine, MatchingPlan, RunContext, Shortfall};
pub use notifier::{LogTransport, NotificationMessage, NotificationTransport, TransportError};
pub use ranking::{rank_candidates, Candidate};
pub use run_tracker::{LogEntry, LogLevel, Run, RunKind, RunStatus, RunTracker};
