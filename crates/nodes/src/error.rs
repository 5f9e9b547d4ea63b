//! Action-level error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of an [`ActionError`].
///
/// Retry policies list the kinds they are willing to re-attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// External call failed in a way that may succeed on a later attempt.
    Transient,
    /// External call failed permanently.
    Fatal,
    /// A data-quality probe returned an unexpected value.
    QualityCheck,
    /// A templated input referenced a parameter the run context lacks.
    Template,
    /// The action panicked instead of returning.
    Panicked,
}

/// A single failed data-quality probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeMismatch {
    pub sql: String,
    pub expected: i64,
    pub actual: i64,
}

/// Errors returned by an action's `execute` method.
///
/// The scheduler uses [`ActionError::kind`] to decide retry behaviour:
/// - `Transient`   : eligible for retry under the task's policy.
/// - anything else : the task is marked failed immediately.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Transient failure; the scheduler may re-attempt the task.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal failure: {0}")]
    Fatal(String),

    /// One or more quality probes did not return the expected value.
    #[error("{} quality check(s) failed: {}", .0.len(), describe_mismatches(.0))]
    QualityCheck(Vec<ProbeMismatch>),

    /// Template rendering failed.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// The action panicked while executing.
    #[error("action panicked: {0}")]
    Panicked(String),
}

impl ActionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ActionError::Transient(_) => FailureKind::Transient,
            ActionError::Fatal(_) => FailureKind::Fatal,
            ActionError::QualityCheck(_) => FailureKind::QualityCheck,
            ActionError::Template(_) => FailureKind::Template,
            ActionError::Panicked(_) => FailureKind::Panicked,
        }
    }
}

fn describe_mismatches(mismatches: &[ProbeMismatch]) -> String {
    mismatches
        .iter()
        .map(|m| format!("`{}` returned {}, expected {}", m.sql, m.actual, m.expected))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised while substituting run-context values into a template.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template `{template}` references unknown parameter '{name}'")]
    MissingParameter { template: String, name: String },

    #[error("template `{template}` has an unterminated placeholder")]
    Unterminated { template: String },

    #[error("template `{template}` has an unmatched '}}'")]
    UnmatchedClose { template: String },

    #[error("template `{template}`: cannot apply format '{spec}' to '{value}'")]
    BadFormat {
        template: String,
        spec: String,
        value: String,
    },
}

/// Errors surfaced by the warehouse and credential collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct WarehouseError {
    /// Whether retrying the same call might succeed.
    pub transient: bool,
    pub message: String,
}

impl WarehouseError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }
}

impl From<WarehouseError> for ActionError {
    fn from(err: WarehouseError) -> Self {
        if err.transient {
            ActionError::Transient(err.message)
        } else {
            ActionError::Fatal(err.message)
        }
    }
}

/// Operator configuration rejected at construction time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{operator}: required field '{field}' is empty")]
    MissingField {
        operator: &'static str,
        field: &'static str,
    },

    #[error("{operator}: {message}")]
    Invalid {
        operator: &'static str,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warehouse_errors_map_to_action_kinds() {
        let transient: ActionError = WarehouseError::transient("connection reset").into();
        assert_eq!(transient.kind(), FailureKind::Transient);

        let fatal: ActionError = WarehouseError::fatal("relation does not exist").into();
        assert_eq!(fatal.kind(), FailureKind::Fatal);
    }

    #[test]
    fn quality_error_lists_every_probe() {
        let err = ActionError::QualityCheck(vec![
            ProbeMismatch { sql: "SELECT 1".into(), expected: 0, actual: 1 },
            ProbeMismatch { sql: "SELECT 2".into(), expected: 0, actual: 2 },
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 quality check(s) failed"));
        assert!(msg.contains("`SELECT 2` returned 2, expected 0"));
    }
}
