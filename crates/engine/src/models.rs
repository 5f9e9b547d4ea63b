//! Core domain models for the engine.
//!
//! A [`Task`] pairs an id and a [`RetryPolicy`] with the action that does
//! the work.  [`TaskState`] is the per-run lifecycle the scheduler drives
//! each task through.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use nodes::{FailureKind, TaskAction};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

/// Where a task is in the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting on at least one upstream task.
    Pending,
    /// Eligible to run; queued or waiting out a retry delay.
    Ready,
    /// An attempt is in flight.
    Running,
    Succeeded,
    /// Out of attempts, or the failure was not retry-eligible.
    Failed,
    /// Deliberately not run.  Reserved for conditional branching; the
    /// scheduler never produces it today.
    Skipped,
    /// Never ran because something upstream failed.
    UpstreamFailed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped | TaskState::UpstreamFailed
        )
    }

    /// Transitions the scheduler is allowed to make.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Pending, UpstreamFailed)
                | (Ready, Running)
                // A task waiting out a retry delay when the run is aborted.
                | (Ready, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                // Retry.
                | (Running, Ready)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
            TaskState::UpstreamFailed => "upstream_failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

fn default_retry_on() -> BTreeSet<FailureKind> {
    BTreeSet::from([FailureKind::Transient])
}

/// How often, and after how long, a failed task is re-attempted.
///
/// Retries use a fixed delay.  Quality-check failures are never retried,
/// whatever `retry_on` says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Re-attempts allowed after the first invocation.
    #[serde(default, alias = "max_attempts", alias = "retries")]
    pub max_retries: u32,
    /// Wait between a failure and the next attempt.
    #[serde(default, rename = "delay_secs", with = "duration_secs")]
    pub delay: Duration,
    /// Failure kinds eligible for retry.
    #[serde(default = "default_retry_on")]
    pub retry_on: BTreeSet<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
            retry_on: default_retry_on(),
        }
    }

    /// Retry transient failures up to `max_retries` times, `delay` apart.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            retry_on: default_retry_on(),
        }
    }

    /// Replace the set of retry-eligible failure kinds.
    pub fn retrying_on(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    /// Whether a failure of `kind` gets another attempt, given
    /// `retries_used` re-attempts so far.
    pub fn allows_retry(&self, retries_used: u32, kind: FailureKind) -> bool {
        kind != FailureKind::QualityCheck
            && retries_used < self.max_retries
            && self.retry_on.contains(&kind)
    }
}

/// Serialises a `Duration` as fractional seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A node in the task graph.
#[derive(Clone)]
pub struct Task {
    /// Unique identifier within the graph (referenced by edges).
    pub id: String,
    pub action: Arc<dyn TaskAction>,
    pub retry_policy: RetryPolicy,
}

impl Task {
    /// A task that is never retried.
    pub fn new(id: impl Into<String>, action: Arc<dyn TaskAction>) -> Self {
        Self {
            id: id.into(),
            action,
            retry_policy: RetryPolicy::none(),
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("action", &self.action.describe())
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// Directed edge: `to` runs only after `from` succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_budget_is_respected() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(300));
        assert!(policy.allows_retry(0, FailureKind::Transient));
        assert!(policy.allows_retry(2, FailureKind::Transient));
        assert!(!policy.allows_retry(3, FailureKind::Transient));
        assert!(!policy.allows_retry(0, FailureKind::Fatal));
    }

    #[test]
    fn quality_failures_are_never_retried() {
        let policy = RetryPolicy::fixed(5, Duration::ZERO)
            .retrying_on([FailureKind::Transient, FailureKind::QualityCheck]);
        assert!(!policy.allows_retry(0, FailureKind::QualityCheck));
    }

    #[test]
    fn policy_deserialises_with_aliases() {
        let policy: RetryPolicy = serde_json::from_value(serde_json::json!({
            "retries": 3,
            "delay_secs": 300,
            "retry_on": ["transient", "fatal"]
        }))
        .unwrap();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.delay, Duration::from_secs(300));
        assert!(policy.retry_on.contains(&FailureKind::Fatal));

        let defaulted: RetryPolicy = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(defaulted, RetryPolicy::none());
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::UpstreamFailed.is_terminal());
        assert!(TaskState::Skipped.is_terminal());
        assert!(!TaskState::Ready.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn running_task_cannot_be_dispatched_again() {
        assert!(!TaskState::Running.can_transition_to(TaskState::Running));
        assert!(!TaskState::Succeeded.can_transition_to(TaskState::Ready));
        assert!(TaskState::Running.can_transition_to(TaskState::Ready));
    }
}
