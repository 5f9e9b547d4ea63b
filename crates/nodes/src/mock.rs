//! `MockAction`: a test double for `TaskAction`.
//!
//! Useful in unit and integration tests where a real warehouse is either
//! unavailable or irrelevant.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{ActionError, RunContext, TaskAction};

/// Behaviour injected into `MockAction` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Always succeed.
    Succeed,
    /// Always fail with the given error.
    Fail(ActionError),
    /// Fail with each queued error in turn, then succeed.
    FailThenSucceed(VecDeque<ActionError>),
    /// Panic inside `execute`.
    Panic(String),
}

/// A mock action that records every call it receives and returns a
/// programmer-specified result.
pub struct MockAction {
    /// Label used in test assertions.
    pub name: String,
    behaviour: Mutex<MockBehaviour>,
    /// Run ids seen by this action (in call order).
    pub calls: Arc<Mutex<Vec<Uuid>>>,
    delay: Duration,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockAction {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour: Mutex::new(behaviour),
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a mock that always succeeds.
    pub fn succeeding(name: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Succeed)
    }

    /// Create a mock that always fails with a `Transient` error.
    pub fn failing_transient(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Fail(ActionError::Transient(msg.into())))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Fail(ActionError::Fatal(msg.into())))
    }

    /// Create a mock that always fails with `error`.
    pub fn failing_with(name: impl Into<String>, error: ActionError) -> Self {
        Self::with_behaviour(name, MockBehaviour::Fail(error))
    }

    /// Create a mock that fails with each of `errors` before succeeding.
    pub fn flaky(name: impl Into<String>, errors: impl IntoIterator<Item = ActionError>) -> Self {
        Self::with_behaviour(
            name,
            MockBehaviour::FailThenSucceed(errors.into_iter().collect()),
        )
    }

    /// Create a mock that panics when executed.
    pub fn panicking(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Panic(msg.into()))
    }

    /// Sleep for `delay` inside every call before returning.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Share in-flight/peak counters with other mocks, to observe how many
    /// actions overlap.
    pub fn with_concurrency_probe(mut self, probe: &ConcurrencyProbe) -> Self {
        self.in_flight = probe.in_flight.clone();
        self.peak = probe.peak.clone();
        self
    }

    /// Number of times this action has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next_outcome(&self) -> Result<(), ActionError> {
        // Release the lock before panicking so later calls don't see poison.
        let outcome = {
            let mut behaviour = self.behaviour.lock().unwrap();
            match &mut *behaviour {
                MockBehaviour::Succeed => Ok(Ok(())),
                MockBehaviour::Fail(err) => Ok(Err(err.clone())),
                MockBehaviour::FailThenSucceed(queue) => Ok(queue.pop_front().map_or(Ok(()), Err)),
                MockBehaviour::Panic(msg) => Err(msg.clone()),
            }
        };
        match outcome {
            Ok(result) => result,
            Err(msg) => panic!("{msg}"),
        }
    }
}

/// Counters shared between mocks to measure overlapping executions.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyProbe {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest number of simultaneously running actions observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskAction for MockAction {
    async fn execute(&self, ctx: &RunContext) -> Result<(), ActionError> {
        self.calls.lock().unwrap().push(ctx.run_id());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.next_outcome()
    }

    fn describe(&self) -> String {
        format!("mock({})", self.name)
    }
}
