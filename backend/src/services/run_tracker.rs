//! Run tracking for matching and dispatch runs.
//!
//! Keeps an in-memory record of each run with timestamped progress lines and
//! a JSON result, so callers can inspect what a run did after the fact.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A single log line with timestamp and message.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Matching,
    Dispatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// Run metadata and logs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub status: RunStatus,
    pub logs: Vec<LogEntry>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Summary of the run (e.g. counts, dispatch id) once it finished.
    pub result: Option<serde_json::Value>,
}

/// In-memory run tracker. Clones share the same store.
#[derive(Clone)]
pub struct RunTracker {
    runs: Arc<RwLock<HashMap<Uuid, Run>>>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a run with a fresh id.
    pub fn start_run(&self, kind: RunKind) -> Uuid {
        let run_id = Uuid::new_v4();
        self.start_run_with_id(run_id, kind);
        run_id
    }

    /// Start a run under an id chosen by the caller.
    pub fn start_run_with_id(&self, run_id: Uuid, kind: RunKind) {
        let run = Run {
            run_id,
            kind,
            status: RunStatus::Running,
            logs: vec![],
            created_at: chrono::Utc::now(),
            completed_at: None,
            result: None,
        };
        self.runs.write().insert(run_id, run);
    }

    pub fn log(&self, run_id: Uuid, level: LogLevel, message: impl Into<String>) {
        let mut runs = self.runs.write();
        if let Some(run) = runs.get_mut(&run_id) {
            run.logs.push(LogEntry {
                timestamp: chrono::Utc::now(),
                level,
                message: message.into(),
            });
        }
    }

    pub fn complete_run(&self, run_id: Uuid, result: Option<serde_json::Value>) {
        let mut runs = self.runs.write();
        if let Some(run) = runs.get_mut(&run_id) {
            run.status = RunStatus::Completed;
            run.completed_at = Some(chrono::Utc::now());
            run.result = result;
        }
    }

    pub fn fail_run(&self, run_id: Uuid, error_message: impl Into<String>) {
        let mut runs = self.runs.write();
        if let Some(run) = runs.get_mut(&run_id) {
            run.status = RunStatus::Failed;
            run.completed_at = Some(chrono::Utc::now());
            run.logs.push(LogEntry {
                timestamp: chrono::Utc::now(),
                level: LogLevel::Error,
                message: error_message.into(),
            });
        }
    }

    pub fn get_run(&self, run_id: Uuid) -> Option<Run> {
        self.runs.read().get(&run_id).cloned()
    }

    pub fn get_logs(&self, run_id: Uuid) -> Vec<LogEntry> {
        self.runs
            .read()
            .get(&run_id)
            .map(|run| run.logs.clone())
            .unwrap_or_default()
    }

    /// Runs of `kind`, oldest first.
    pub fn list_runs(&self, kind: RunKind) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .runs
            .read()
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}
