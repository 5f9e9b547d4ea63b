//! Run lifecycle events and the sinks that receive them.
//!
//! The scheduler reports progress as [`RunEvent`]s.  Where they end up is
//! the sink's business: the default [`TracingSink`] turns them into
//! structured log lines.

use std::io::Write;
use std::sync::Mutex;

use nodes::FailureKind;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::report::RunStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    TaskStarted {
        task_id: String,
        attempt: u32,
    },
    TaskSucceeded {
        task_id: String,
        attempt: u32,
        elapsed_ms: u64,
    },
    TaskRetrying {
        task_id: String,
        /// The attempt that just failed.
        attempt: u32,
        delay_ms: u64,
        kind: FailureKind,
        message: String,
    },
    TaskFailed {
        task_id: String,
        attempts: u32,
        kind: FailureKind,
        message: String,
    },
    /// The task will never run because `upstream` failed.
    TaskSkipped {
        task_id: String,
        upstream: String,
    },
    RunCompleted {
        run_id: Uuid,
        status: RunStatus,
        elapsed_ms: u64,
    },
}

impl RunEvent {
    pub fn task_id(&self) -> Option<&str> {
        match self {
            RunEvent::TaskStarted { task_id, .. }
            | RunEvent::TaskSucceeded { task_id, .. }
            | RunEvent::TaskRetrying { task_id, .. }
            | RunEvent::TaskFailed { task_id, .. }
            | RunEvent::TaskSkipped { task_id, .. } => Some(task_id),
            RunEvent::RunCompleted { .. } => None,
        }
    }
}

/// Receiver for run events.  Called from the scheduling loop, so
/// implementations should return quickly.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &RunEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &RunEvent) {
        match event {
            RunEvent::TaskStarted { task_id, attempt } => {
                info!(task_id = %task_id, attempt, "task started");
            }
            RunEvent::TaskSucceeded { task_id, attempt, elapsed_ms } => {
                info!(task_id = %task_id, attempt, elapsed_ms, "task succeeded");
            }
            RunEvent::TaskRetrying { task_id, attempt, delay_ms, kind, message } => {
                warn!(task_id = %task_id, attempt, delay_ms, ?kind, "task failed, retrying: {message}");
            }
            RunEvent::TaskFailed { task_id, attempts, kind, message } => {
                error!(task_id = %task_id, attempts, ?kind, "task failed: {message}");
            }
            RunEvent::TaskSkipped { task_id, upstream } => {
                warn!(task_id = %task_id, upstream = %upstream, "task skipped, upstream failed");
            }
            RunEvent::RunCompleted { run_id, status, elapsed_ms } => {
                info!(run_id = %run_id, ?status, elapsed_ms, "run completed");
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<RunEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &RunEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

/// Writes one JSON object per line.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn emit(&self, event: &RunEvent) {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let written = serde_json::to_writer(&mut *writer, event)
            .map_err(std::io::Error::from)
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush());
        if let Err(e) = written {
            warn!("failed to write run event: {e}");
        }
    }
}
