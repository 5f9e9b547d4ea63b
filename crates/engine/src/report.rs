//! Outcome of a finished (or aborted) run.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nodes::{ActionError, FailureKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{duration_secs, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every task succeeded (or was skipped).
    Succeeded,
    /// At least one task failed.
    Failed,
    /// Cancelled before every task resolved.
    Aborted,
}

/// The last failure a task hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&ActionError> for FailureSummary {
    fn from(err: &ActionError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub state: TaskState,
    /// Number of times the action was invoked.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureSummary>,
    /// For upstream-failed tasks: the failed task that caused the skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_cause: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub logical_timestamp: DateTime<Utc>,
    pub status: RunStatus,
    pub tasks: BTreeMap<String, TaskReport>,
    /// Tasks whose own action failed: the root causes.
    pub failed: BTreeSet<String>,
    /// Tasks that never ran because something upstream failed.
    pub upstream_failed: BTreeSet<String>,
    /// Tasks left unresolved by an abort.
    pub not_run: BTreeSet<String>,
    #[serde(rename = "elapsed_secs", with = "duration_secs")]
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn state_of(&self, task_id: &str) -> Option<TaskState> {
        self.tasks.get(task_id).map(|t| t.state)
    }

    pub fn attempts_of(&self, task_id: &str) -> Option<u32> {
        self.tasks.get(task_id).map(|t| t.attempts)
    }
}

impl fmt::Display for RunReport {
    /// Human-readable summary: one line per task, root causes first.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "run {} ({}) {:?} in {:.2}s",
            self.run_id,
            self.logical_timestamp.format("%Y-%m-%d %H:%M"),
            self.status,
            self.elapsed.as_secs_f64()
        )?;

        let width = self.tasks.keys().map(String::len).max().unwrap_or(0);
        for (id, task) in &self.tasks {
            write!(f, "  {id:<width$}  {:<15}  attempts={}", task.state.to_string(), task.attempts)?;
            if let Some(failure) = &task.failure {
                write!(f, "  [{:?}] {}", failure.kind, failure.message)?;
            }
            if let Some(cause) = &task.upstream_cause {
                write!(f, "  (upstream: {cause})")?;
            }
            writeln!(f)?;
        }

        if !self.failed.is_empty() {
            writeln!(f, "failed: {}", join(&self.failed))?;
        }
        if !self.upstream_failed.is_empty() {
            writeln!(f, "upstream failed: {}", join(&self.upstream_failed))?;
        }
        if !self.not_run.is_empty() {
            writeln!(f, "not run: {}", join(&self.not_run))?;
        }
        Ok(())
    }
}

fn join(ids: &BTreeSet<String>) -> String {
    ids.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}
