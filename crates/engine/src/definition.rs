//! Pipeline definitions: the on-disk description of a task graph.
//!
//! A definition is plain JSON:
//!
//! ```json
//! {
//!   "dag_id": "sparkify",
//!   "default_args": { "owner": "etl", "retries": 3, "retry_delay_secs": 300 },
//!   "tasks": [
//!     { "id": "start", "action": { "operator": "no_op" } },
//!     { "id": "load", "action": { "operator": "load_fact", "table": "t", "sql_query": "SELECT 1" },
//!       "retry": { "retries": 0 } }
//!   ],
//!   "chains": [["start", "load"]]
//! }
//! ```
//!
//! `chains` mirror list chaining: each element is a task id or a list of
//! ids, and every task in one element becomes a dependency of every task in
//! the next.  Plain `edges` can be mixed in as well.

use std::collections::BTreeSet;
use std::time::Duration;

use nodes::{Collaborators, FailureKind, OperatorConfig};
use serde::{Deserialize, Serialize};

use crate::dag::TaskGraph;
use crate::models::{Edge, RetryPolicy, Task};
use crate::EngineError;

fn default_retry_on() -> BTreeSet<FailureKind> {
    BTreeSet::from([FailureKind::Transient])
}

/// Settings applied to every task unless the task overrides them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultArgs {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub retry_delay_secs: f64,
    #[serde(default = "default_retry_on")]
    pub retry_on: BTreeSet<FailureKind>,
}

impl Default for DefaultArgs {
    fn default() -> Self {
        Self {
            owner: None,
            retries: 0,
            retry_delay_secs: 0.0,
            retry_on: default_retry_on(),
        }
    }
}

impl DefaultArgs {
    pub fn retry_policy(&self) -> Result<RetryPolicy, EngineError> {
        let delay = Duration::try_from_secs_f64(self.retry_delay_secs).map_err(|e| {
            EngineError::Definition(serde::de::Error::custom(format!(
                "default_args.retry_delay_secs: {e}"
            )))
        })?;
        Ok(RetryPolicy::fixed(self.retries, delay).retrying_on(self.retry_on.iter().copied()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub action: OperatorConfig,
    /// Replaces the default retry policy for this task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// One element of a chain: a single task or a parallel group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChainLink {
    One(String),
    Many(Vec<String>),
}

impl ChainLink {
    fn ids(&self) -> &[String] {
        match self {
            ChainLink::One(id) => std::slice::from_ref(id),
            ChainLink::Many(ids) => ids,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub dag_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub default_args: DefaultArgs,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub chains: Vec<Vec<ChainLink>>,
}

impl PipelineDefinition {
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Check every operator configuration without building anything.
    pub fn validate_operators(&self) -> Result<(), EngineError> {
        for task in &self.tasks {
            task.action
                .validate()
                .map_err(|source| EngineError::InvalidTaskConfig {
                    task_id: task.id.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Instantiate every task against `with` and wire up the edges.
    ///
    /// The graph is not validated for cycles here; the executor does that
    /// before running.
    pub fn build_graph(&self, with: &Collaborators) -> Result<TaskGraph, EngineError> {
        let default_policy = self.default_args.retry_policy()?;
        let mut graph = TaskGraph::new();

        for def in &self.tasks {
            let action = def
                .action
                .build(with)
                .map_err(|source| EngineError::InvalidTaskConfig {
                    task_id: def.id.clone(),
                    source,
                })?;
            let policy = def.retry.clone().unwrap_or_else(|| default_policy.clone());
            graph.add_task(Task::new(def.id.clone(), action).with_retry(policy))?;
        }

        for edge in &self.edges {
            graph.add_edge(&edge.from, &edge.to)?;
        }
        for chain in &self.chains {
            for pair in chain.windows(2) {
                graph.add_edges(pair[0].ids(), pair[1].ids())?;
            }
        }

        Ok(graph)
    }
}
