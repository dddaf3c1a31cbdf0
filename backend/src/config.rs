//! Engine configuration file support.
//!
//! Settings are read from an `engine.toml` file. Every field has a default,
//! so an empty file (or [`EngineConfig::default`]) is a valid configuration.
//!
//! ```toml
//! [repository]
//! type = "local"
//!
//! [distance]
//! max_distance_meters = 80000
//!
//! [matching]
//! role_policy = "lead_then_assistant"
//!
//! [dispatch]
//! max_attempts = 4
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::db::factory::RepositoryType;
use crate::db::repository::RepositoryError;

/// Upper bound for hour-valued settings (ten years).
pub const MAX_HOURS: u64 = 87_600;
/// Upper bound for `fairness.lookback_days` (ten years).
pub const MAX_LOOKBACK_DAYS: u32 = 3_650;
/// Upper bound for millisecond-valued settings (one day).
pub const MAX_MILLIS: u64 = 86_400_000;

fn hours(value: u64) -> chrono::Duration {
    chrono::Duration::try_hours(value.min(MAX_HOURS) as i64).unwrap_or(chrono::Duration::MAX)
}

fn millis(value: u64) -> chrono::Duration {
    chrono::Duration::try_milliseconds(value.min(MAX_MILLIS) as i64)
        .unwrap_or(chrono::Duration::MAX)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub repository: RepositorySettings,
    #[serde(default)]
    pub distance: DistanceSettings,
    #[serde(default)]
    pub fairness: FairnessSettings,
    #[serde(default)]
    pub matching: MatchingSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySettings {
    #[serde(rename = "type", default = "default_repo_type")]
    pub repo_type: String,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            repo_type: default_repo_type(),
        }
    }
}

/// Distance eligibility and resolver limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceSettings {
    /// Instructors farther than this from a unit are ineligible.
    #[serde(default = "default_max_distance_meters")]
    pub max_distance_meters: u64,
    /// Cached distances older than this are resolved again.
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: u64,
    #[serde(default = "default_max_concurrent_lookups")]
    pub max_concurrent_lookups: usize,
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
}

impl Default for DistanceSettings {
    fn default() -> Self {
        Self {
            max_distance_meters: default_max_distance_meters(),
            cache_ttl_hours: default_cache_ttl_hours(),
            max_concurrent_lookups: default_max_concurrent_lookups(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
        }
    }
}

impl DistanceSettings {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        hours(self.cache_ttl_hours)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FairnessSettings {
    /// Ledger entries older than this no longer count.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default = "default_no_response_penalty")]
    pub no_response_penalty: i64,
    #[serde(default = "default_rejection_penalty")]
    pub rejection_penalty: i64,
    /// Rejections inside the lookback window before each further one is penalized.
    #[serde(default = "default_rejection_threshold")]
    pub rejection_threshold: u32,
    #[serde(default = "default_completion_credit")]
    pub completion_credit: i64,
}

impl Default for FairnessSettings {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            no_response_penalty: default_no_response_penalty(),
            rejection_penalty: default_rejection_penalty(),
            rejection_threshold: default_rejection_threshold(),
            completion_credit: default_completion_credit(),
        }
    }
}

impl FairnessSettings {
    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::try_days(i64::from(self.lookback_days.min(MAX_LOOKBACK_DAYS)))
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// How roles are handed out when a unit needs several instructors on a date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolePolicy {
    /// Every reservation is `Main`.
    #[default]
    AllMain,
    /// First reservation per (unit, date) leads, the rest assist.
    LeadThenAssistant,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchingSettings {
    #[serde(default)]
    pub role_policy: RolePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Total transport attempts per delivery, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// How long an instructor may leave a delivered assignment unanswered.
    #[serde(default = "default_response_timeout_hours")]
    pub response_timeout_hours: u64,
    #[serde(default = "default_retry_poll_interval_ms")]
    pub retry_poll_interval_ms: u64,
    /// A transport call running longer than this counts as a transient
    /// timeout, and an in-flight attempt older than this is taken over.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            response_timeout_hours: default_response_timeout_hours(),
            retry_poll_interval_ms: default_retry_poll_interval_ms(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl DispatchSettings {
    /// Delay before the next attempt after `attempts` failed ones:
    /// `min(base * 2^(attempts-1), max)`.
    pub fn backoff(&self, attempts: u32) -> chrono::Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let delay = self
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        millis(delay)
    }

    pub fn response_timeout(&self) -> chrono::Duration {
        hours(self.response_timeout_hours)
    }

    pub fn retry_poll_interval(&self) -> Duration {
        Duration::from_millis(self.retry_poll_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.min(MAX_MILLIS))
    }

    /// Age after which a `Scheduled` or `InFlight` delivery is considered orphaned.
    pub fn orphan_after(&self) -> chrono::Duration {
        millis(self.send_timeout_ms)
    }
}

fn default_repo_type() -> String {
    "local".to_string()
}

fn default_max_distance_meters() -> u64 {
    100_000
}

fn default_cache_ttl_hours() -> u64 {
    720
}

fn default_max_concurrent_lookups() -> usize {
    8
}

fn default_lookup_timeout_ms() -> u64 {
    5_000
}

fn default_lookback_days() -> u32 {
    365
}

fn default_no_response_penalty() -> i64 {
    5
}

fn default_rejection_penalty() -> i64 {
    2
}

fn default_rejection_threshold() -> u32 {
    3
}

fn default_completion_credit() -> i64 {
    1
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    30_000
}

fn default_max_backoff_ms() -> u64 {
    3_600_000
}

fn default_response_timeout_hours() -> u64 {
    72
}

fn default_send_timeout_ms() -> u64 {
    30_000
}

fn default_retry_poll_interval_ms() -> u64 {
    10_000
}

impl FromStr for EngineConfig {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: EngineConfig = toml::from_str(s).map_err(|e| {
            RepositoryError::configuration(format!("Failed to parse config file: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }
}

impl EngineConfig {
    /// Load engine configuration from a TOML file.
    ///
    /// # Returns
    /// * `Ok(EngineConfig)` if successful
    /// * `Err(RepositoryError::Configuration)` if the file cannot be read,
    ///   parsed, or fails validation
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            RepositoryError::configuration(format!("Failed to read config file: {}", e))
        })?;
        content.parse()
    }

    /// Load engine configuration from the default location.
    ///
    /// Searches for `engine.toml` in:
    /// 1. Current directory
    /// 2. `backend/` directory
    /// 3. Parent directory
    pub fn from_default_location() -> Result<Self, RepositoryError> {
        let search_paths = [
            PathBuf::from("engine.toml"),
            PathBuf::from("backend/engine.toml"),
            PathBuf::from("../engine.toml"),
        ];

        for path in search_paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(RepositoryError::configuration(
            "No engine.toml found in standard locations",
        ))
    }

    pub fn repository_type(&self) -> Result<RepositoryType, String> {
        RepositoryType::from_str(&self.repository.repo_type)
    }

    pub fn validate(&self) -> Result<(), RepositoryError> {
        if self.dispatch.max_attempts == 0 {
            return Err(RepositoryError::configuration(
                "dispatch.max_attempts must be at least 1",
            ));
        }
        if self.distance.max_concurrent_lookups == 0 {
            return Err(RepositoryError::configuration(
                "distance.max_concurrent_lookups must be at least 1",
            ));
        }
        if self.dispatch.base_backoff_ms > self.dispatch.max_backoff_ms {
            return Err(RepositoryError::configuration(
                "dispatch.base_backoff_ms must not exceed dispatch.max_backoff_ms",
            ));
        }
        if self.dispatch.send_timeout_ms == 0 {
            return Err(RepositoryError::configuration(
                "dispatch.send_timeout_ms must be at least 1",
            ));
        }

        let hour_fields = [
            ("distance.cache_ttl_hours", self.distance.cache_ttl_hours),
            ("dispatch.response_timeout_hours", self.dispatch.response_timeout_hours),
        ];
        for (name, value) in hour_fields {
            if value > MAX_HOURS {
                return Err(RepositoryError::configuration(format!(
                    "{name} must not exceed {MAX_HOURS}, got {value}"
                )));
            }
        }
        let milli_fields = [
            ("distance.lookup_timeout_ms", self.distance.lookup_timeout_ms),
            ("dispatch.max_backoff_ms", self.dispatch.max_backoff_ms),
            ("dispatch.retry_poll_interval_ms", self.dispatch.retry_poll_interval_ms),
            ("dispatch.send_timeout_ms", self.dispatch.send_timeout_ms),
        ];
        for (name, value) in milli_fields {
            if value > MAX_MILLIS {
                return Err(RepositoryError::configuration(format!(
                    "{name} must not exceed {MAX_MILLIS}, got {value}"
                )));
            }
        }
        if self.fairness.lookback_days > MAX_LOOKBACK_DAYS {
            return Err(RepositoryError::configuration(format!(
                "fairness.lookback_days must not exceed {MAX_LOOKBACK_DAYS}, got {}",
                self.fairness.lookback_days
            )));
        }
        Ok(())
    }
}
