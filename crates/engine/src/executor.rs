//! Run scheduler.
//!
//! `DagExecutor` drives one run of a [`TaskGraph`]:
//! 1. Validates the graph and pre-renders every task's templated inputs.
//! 2. Marks tasks ready as soon as all of their upstreams have succeeded and
//!    dispatches them onto the tokio runtime, at most `max_concurrency` at a
//!    time.
//! 3. Applies each task's `RetryPolicy` to failures (fixed delay).
//! 4. Marks everything downstream of a failed task `UpstreamFailed`.
//! 5. Returns a [`RunReport`] once every task is terminal, or once a
//!    cancelled run has drained its in-flight work.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nodes::{ActionError, RunContext, TaskAction};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::dag::TaskGraph;
use crate::events::{EventSink, RunEvent, TracingSink};
use crate::models::TaskState;
use crate::report::{FailureSummary, RunReport, RunStatus, TaskReport};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Upper bound on actions running at once.  `None` means every ready
    /// task is dispatched immediately.
    pub max_concurrency: Option<NonZeroUsize>,
}

impl ExecutorConfig {
    /// Bound the number of actions running at once.
    ///
    /// A limit of `0` is raised to `1`: the run still makes progress, one
    /// task at a time.  Use [`ExecutorConfig::default`] for no bound.
    pub fn with_max_concurrency(limit: usize) -> Self {
        Self {
            max_concurrency: NonZeroUsize::new(limit.max(1)),
        }
    }
}

// ---------------------------------------------------------------------------
// DagExecutor
// ---------------------------------------------------------------------------

/// Stateless orchestrator that runs a single graph execution.
///
/// Construct one executor per process (or even per run) and call
/// [`DagExecutor::run`] with the graph and the run context.
pub struct DagExecutor {
    config: ExecutorConfig,
    sink: Arc<dyn EventSink>,
}

impl DagExecutor {
    /// Create an executor that reports events through `tracing`.
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            sink: Arc::new(TracingSink),
        }
    }

    /// Send run events to `sink` instead.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Run the graph to completion.
    ///
    /// # Errors
    /// Returns `EngineError` if the graph is invalid, a template cannot be
    /// rendered, or the scheduler hits an internal inconsistency.  Task
    /// failures are not errors; they are recorded in the report.
    pub async fn run(&self, graph: &TaskGraph, ctx: RunContext) -> Result<RunReport, EngineError> {
        self.run_with_cancel(graph, ctx, CancellationToken::new()).await
    }

    /// Like [`DagExecutor::run`], but stops dispatching new work once
    /// `cancel` fires.  Actions already in flight are allowed to finish.
    #[instrument(skip_all, fields(run_id = %ctx.run_id()))]
    pub async fn run_with_cancel(
        &self,
        graph: &TaskGraph,
        ctx: RunContext,
        cancel: CancellationToken,
    ) -> Result<RunReport, EngineError> {
        let started = Instant::now();

        // ------------------------------------------------------------------
        // Nothing runs unless the whole graph and every input is sound.
        // ------------------------------------------------------------------
        let order = graph
            .validate()
            .map_err(|e| EngineError::ValidationFailed(Box::new(e)))?;
        info!(
            "graph validated: {} tasks, topological order {:?}",
            order.len(),
            order
        );
        render_templates(graph, &ctx)?;

        let mut run = RunLoop {
            graph,
            ctx,
            sink: self.sink.as_ref(),
            limit: self.config.max_concurrency.map_or(usize::MAX, NonZeroUsize::get),
            records: RunState::new(graph),
            queue: VecDeque::new(),
            workers: JoinSet::new(),
            timers: JoinSet::new(),
            waiting_retry: BTreeSet::new(),
            cancelled: false,
        };
        run.drive(&cancel).await?;

        let report = run.into_report(started.elapsed());
        self.sink.emit(&RunEvent::RunCompleted {
            run_id: report.run_id,
            status: report.status,
            elapsed_ms: millis(report.elapsed),
        });
        Ok(report)
    }
}

/// Fail fast on missing parameters before any side effect happens.
fn render_templates(graph: &TaskGraph, ctx: &RunContext) -> Result<(), EngineError> {
    for task in graph.tasks() {
        for template in task.action.templates() {
            ctx.render(template).map_err(|source| EngineError::Template {
                task_id: task.id.clone(),
                source,
            })?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-run state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TaskRecord {
    state: TaskState,
    /// Action invocations so far.
    attempts: u32,
    retries: u32,
    last_error: Option<ActionError>,
    upstream_cause: Option<String>,
}

/// Task states for one run.  Only the scheduling loop writes here; workers
/// report back through the join set.
struct RunState {
    records: BTreeMap<String, TaskRecord>,
}

impl RunState {
    fn new(graph: &TaskGraph) -> Self {
        let records = graph
            .task_ids()
            .map(|id| {
                let record = TaskRecord {
                    state: TaskState::Pending,
                    attempts: 0,
                    retries: 0,
                    last_error: None,
                    upstream_cause: None,
                };
                (id.to_owned(), record)
            })
            .collect();
        Self { records }
    }

    fn state(&self, id: &str) -> Option<TaskState> {
        self.records.get(id).map(|r| r.state)
    }

    fn states(&self) -> HashMap<String, TaskState> {
        self.records
            .iter()
            .map(|(id, r)| (id.clone(), r.state))
            .collect()
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut TaskRecord, EngineError> {
        self.records.get_mut(id).ok_or_else(|| EngineError::UnknownTask {
            task_id: id.to_owned(),
            side: "run",
        })
    }

    /// Apply a state change, refusing anything outside the lifecycle.
    fn transition(&mut self, id: &str, to: TaskState) -> Result<&mut TaskRecord, EngineError> {
        let record = self.get_mut(id)?;
        if !record.state.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                task_id: id.to_owned(),
                from: record.state,
                to,
            });
        }
        debug!(task_id = %id, from = %record.state, to = %to, "task state change");
        record.state = to;
        Ok(record)
    }

    fn all_terminal(&self) -> bool {
        self.records.values().all(|r| r.state.is_terminal())
    }

    fn unresolved(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|(_, r)| !r.state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// What a worker hands back after one attempt.
struct Attempt {
    task_id: String,
    attempt: u32,
    elapsed: Duration,
    result: Result<(), ActionError>,
}

// ---------------------------------------------------------------------------
// Scheduling loop
// ---------------------------------------------------------------------------

struct RunLoop<'a> {
    graph: &'a TaskGraph,
    ctx: RunContext,
    sink: &'a dyn EventSink,
    limit: usize,
    records: RunState,
    /// Ready tasks waiting for a free slot.
    queue: VecDeque<String>,
    workers: JoinSet<Attempt>,
    /// Retry delays; each yields its task id when it elapses.
    timers: JoinSet<String>,
    waiting_retry: BTreeSet<String>,
    cancelled: bool,
}

impl<'a> RunLoop<'a> {
    async fn drive(&mut self, cancel: &CancellationToken) -> Result<(), EngineError> {
        loop {
            if !self.cancelled {
                self.enqueue_ready()?;
                self.dispatch_queued()?;
            }

            if self.workers.is_empty() && self.timers.is_empty() {
                if self.cancelled || self.records.all_terminal() {
                    return Ok(());
                }
                // Only reachable through a lifecycle bug.
                return Err(EngineError::SchedulingStalled {
                    pending: self.records.unresolved(),
                });
            }

            tokio::select! {
                Some(joined) = self.workers.join_next() => {
                    let attempt = joined?;
                    self.on_attempt(attempt)?;
                }
                Some(joined) = self.timers.join_next() => {
                    let task_id = joined?;
                    self.on_retry_due(task_id);
                }
                _ = cancel.cancelled(), if !self.cancelled => {
                    self.on_cancel()?;
                }
            }
        }
    }

    /// Move every newly ready task from Pending to Ready and queue it.
    fn enqueue_ready(&mut self) -> Result<(), EngineError> {
        for id in self.graph.ready_tasks(&self.records.states()) {
            self.records.transition(&id, TaskState::Ready)?;
            self.queue.push_back(id);
        }
        Ok(())
    }

    fn dispatch_queued(&mut self) -> Result<(), EngineError> {
        while self.workers.len() < self.limit {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            self.dispatch(id)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, id: String) -> Result<(), EngineError> {
        let graph = self.graph;
        let task = graph.task(&id).ok_or_else(|| EngineError::UnknownTask {
            task_id: id.clone(),
            side: "run",
        })?;

        // Ready -> Running fails for a task that is already running, so a
        // task id can never have two attempts in flight.
        let record = self.records.transition(&id, TaskState::Running)?;
        record.attempts += 1;
        let attempt = record.attempts;

        self.sink.emit(&RunEvent::TaskStarted {
            task_id: id.clone(),
            attempt,
        });

        let action = Arc::clone(&task.action);
        let ctx = self.ctx.clone();
        self.workers.spawn(async move {
            let started = Instant::now();
            let result = execute_isolated(action, ctx).await;
            Attempt {
                task_id: id,
                attempt,
                elapsed: started.elapsed(),
                result,
            }
        });
        Ok(())
    }

    fn on_attempt(&mut self, done: Attempt) -> Result<(), EngineError> {
        let Attempt {
            task_id,
            attempt,
            elapsed,
            result,
        } = done;

        let err = match result {
            Ok(()) => {
                self.records.transition(&task_id, TaskState::Succeeded)?;
                self.sink.emit(&RunEvent::TaskSucceeded {
                    task_id,
                    attempt,
                    elapsed_ms: millis(elapsed),
                });
                return Ok(());
            }
            Err(err) => err,
        };

        let graph = self.graph;
        let policy = match graph.task(&task_id) {
            Some(task) => &task.retry_policy,
            None => {
                return Err(EngineError::UnknownTask {
                    task_id,
                    side: "run",
                })
            }
        };
        let retries_used = self.records.get_mut(&task_id)?.retries;

        if self.cancelled || !policy.allows_retry(retries_used, err.kind()) {
            return self.fail(&task_id, err);
        }

        let record = self.records.transition(&task_id, TaskState::Ready)?;
        record.retries += 1;
        record.last_error = Some(err.clone());

        self.sink.emit(&RunEvent::TaskRetrying {
            task_id: task_id.clone(),
            attempt,
            delay_ms: millis(policy.delay),
            kind: err.kind(),
            message: err.to_string(),
        });

        let delay = policy.delay;
        self.waiting_retry.insert(task_id.clone());
        self.timers.spawn(async move {
            tokio::time::sleep(delay).await;
            task_id
        });
        Ok(())
    }

    fn on_retry_due(&mut self, task_id: String) {
        self.waiting_retry.remove(&task_id);
        self.queue.push_back(task_id);
    }

    /// Terminal failure: record it and resolve everything downstream.
    fn fail(&mut self, task_id: &str, err: ActionError) -> Result<(), EngineError> {
        let record = self.records.transition(task_id, TaskState::Failed)?;
        let attempts = record.attempts;
        self.sink.emit(&RunEvent::TaskFailed {
            task_id: task_id.to_owned(),
            attempts,
            kind: err.kind(),
            message: err.to_string(),
        });
        record.last_error = Some(err);

        for down in self.graph.downstream_of(task_id) {
            if self.records.state(&down) != Some(TaskState::Pending) {
                continue;
            }
            let record = self.records.transition(&down, TaskState::UpstreamFailed)?;
            record.upstream_cause = Some(task_id.to_owned());
            self.sink.emit(&RunEvent::TaskSkipped {
                task_id: down,
                upstream: task_id.to_owned(),
            });
        }
        Ok(())
    }

    fn on_cancel(&mut self) -> Result<(), EngineError> {
        self.cancelled = true;
        warn!(
            in_flight = self.workers.len(),
            "run cancelled; no new tasks will be dispatched"
        );

        // Dropping the join set aborts the pending retry sleeps.
        drop(std::mem::take(&mut self.timers));
        for task_id in std::mem::take(&mut self.waiting_retry) {
            let err = self
                .records
                .get_mut(&task_id)?
                .last_error
                .take()
                .unwrap_or_else(|| ActionError::Fatal("cancelled while waiting to retry".into()));
            self.fail(&task_id, err)?;
        }

        // Queued tasks never started; they stay Ready and show up as not run.
        self.queue.clear();
        Ok(())
    }

    fn into_report(self, elapsed: Duration) -> RunReport {
        let mut failed = BTreeSet::new();
        let mut upstream_failed = BTreeSet::new();
        let mut not_run = BTreeSet::new();

        let tasks: BTreeMap<String, TaskReport> = self
            .records
            .records
            .into_iter()
            .map(|(id, record)| {
                match record.state {
                    TaskState::Failed => {
                        failed.insert(id.clone());
                    }
                    TaskState::UpstreamFailed => {
                        upstream_failed.insert(id.clone());
                    }
                    state if !state.is_terminal() => {
                        not_run.insert(id.clone());
                    }
                    _ => {}
                }
                let failure = match record.state {
                    TaskState::Failed => record.last_error.as_ref().map(FailureSummary::from),
                    _ => None,
                };
                let report = TaskReport {
                    state: record.state,
                    attempts: record.attempts,
                    failure,
                    upstream_cause: record.upstream_cause,
                };
                (id, report)
            })
            .collect();

        let status = if !not_run.is_empty() {
            RunStatus::Aborted
        } else if tasks
            .values()
            .all(|t| matches!(t.state, TaskState::Succeeded | TaskState::Skipped))
        {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };

        RunReport {
            run_id: self.ctx.run_id(),
            logical_timestamp: self.ctx.logical_timestamp(),
            status,
            tasks,
            failed,
            upstream_failed,
            not_run,
            elapsed,
        }
    }
}

/// Run the action on its own tokio task so a panic comes back as a failure
/// instead of unwinding through the worker.
async fn execute_isolated(action: Arc<dyn TaskAction>, ctx: RunContext) -> Result<(), ActionError> {
    match tokio::spawn(async move { action.execute(&ctx).await }).await {
        Ok(result) => result,
        Err(err) => Err(ActionError::Panicked(panic_message(err))),
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
