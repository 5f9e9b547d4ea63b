//! Engine-level error types.

use nodes::{ConfigError, TemplateError};
use thiserror::Error;

use crate::models::TaskState;

/// Errors produced by the engine (graph construction, validation, and the
/// scheduling loop itself).
///
/// Action failures are *not* engine errors: they end up in the run report.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Construction errors ------

    /// A task with this ID is already part of the graph.
    #[error("duplicate task ID: '{0}'")]
    DuplicateTaskId(String),

    /// An edge references a task ID that doesn't exist in the graph.
    #[error("edge references unknown task '{task_id}' ({side} side)")]
    UnknownTask {
        task_id: String,
        side: &'static str,
    },

    /// A task's operator configuration was rejected.
    #[error("task '{task_id}' is misconfigured: {source}")]
    InvalidTaskConfig {
        task_id: String,
        #[source]
        source: ConfigError,
    },

    /// The pipeline definition could not be parsed.
    #[error("invalid pipeline definition: {0}")]
    Definition(#[from] serde_json::Error),

    // ------ Validation errors ------

    /// The graph contains a cycle running through `task_id`.
    #[error("task graph contains a cycle through '{task_id}'")]
    CycleDetected { task_id: String },

    /// The graph failed validation; nothing was executed.
    #[error("graph validation failed: {0}")]
    ValidationFailed(#[source] Box<EngineError>),

    /// A task's templated input cannot be rendered for this run.
    #[error("task '{task_id}' cannot render its inputs: {source}")]
    Template {
        task_id: String,
        #[source]
        source: TemplateError,
    },

    // ------ Execution errors ------

    /// Tasks remain unresolved but nothing is ready, running, or waiting.
    #[error("scheduling stalled with unresolved tasks: {}", .pending.join(", "))]
    SchedulingStalled { pending: Vec<String> },

    /// A state change the scheduler never makes was requested.
    #[error("task '{task_id}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },

    /// A worker task was lost before reporting its outcome.
    #[error("worker join failed: {0}")]
    WorkerJoin(#[from] tokio::task::JoinError),
}
