//! The `TaskAction` trait: the contract every task variant must fulfil.

use async_trait::async_trait;

use crate::{ActionError, RunContext};

/// The core action trait.
///
/// Built-in operators and test doubles implement this; the engine only ever
/// sees `Arc<dyn TaskAction>`.
#[async_trait]
pub trait TaskAction: Send + Sync {
    /// Perform the unit of work for one attempt.
    ///
    /// The action learns nothing about retries: it reports success or a
    /// classified failure and the scheduler decides what happens next.
    async fn execute(&self, ctx: &RunContext) -> Result<(), ActionError>;

    /// Short human-readable summary, e.g. `load_fact(songplays)`.
    fn describe(&self) -> String;

    /// Template strings this action will render at execution time.
    ///
    /// The scheduler renders each of these before the first dispatch so a
    /// missing parameter aborts the run instead of failing mid-way.
    fn templates(&self) -> Vec<&str> {
        Vec::new()
    }
}
