//! `engine` crate: task graph, retry model, and the single-run scheduler.

pub mod dag;
pub mod definition;
pub mod error;
pub mod events;
pub mod executor;
pub mod models;
pub mod report;

pub use dag::TaskGraph;
pub use definition::PipelineDefinition;
pub use error::EngineError;
pub use events::{CollectingSink, EventSink, JsonLinesSink, RunEvent, TracingSink};
pub use executor::{DagExecutor, ExecutorConfig};
pub use models::{Edge, RetryPolicy, Task, TaskState};
pub use report::{FailureSummary, RunReport, RunStatus, TaskReport};
