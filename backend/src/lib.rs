//! # Instructor Dispatch Engine
//!
//! Assigns instructors to unit training dates and notifies them.
//!
//! Units publish training windows and locations with a required headcount;
//! instructors declare the dates they are available. A matching run fills
//! each (unit, date) slot with the nearest-enough, fairest candidates, never
//! booking an instructor twice on one date and never exceeding a slot's
//! demand. Each assignment then moves through an accept/reject lifecycle
//! while the dispatch pipeline delivers notifications with retry.
//!
//! ## Architecture
//!
//! - [`models`]: Domain records and identifiers
//! - [`db`]: Repository traits and the in-memory backend
//! - [`services`]: Distance eligibility, fairness ledger, ranking, matching,
//!   assignment lifecycle, dispatch and run tracking
//! - [`engine`]: The [`Engine`] facade callers drive
//! - [`config`]: TOML configuration
//! - [`error`]: Engine error type
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use instructor_dispatch::config::EngineConfig;
//! use instructor_dispatch::services::{HaversineResolver, LogTransport};
//! use instructor_dispatch::Engine;
//!
//! # async fn demo() -> Result<(), instructor_dispatch::EngineError> {
//! let engine = Engine::from_config(
//!     EngineConfig::default(),
//!     Arc::new(HaversineResolver::default()),
//!     Arc::new(LogTransport),
//! )?;
//! let summary = engine.run_matching().await?;
//! println!("{} assignments created", summary.assignments_created);
//! # Ok(())
//! # }
//! ```

// Allow large error types - RepositoryError contains rich context for debugging
#![allow(clippy::result_large_err)]

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod services;

pub use engine::{Engine, MatchingSummary};
pub use error::{EngineError, EngineResult};
