//! Task graph: construction, validation, and readiness.
//!
//! Rules enforced:
//! 1. Task IDs are unique within the graph (checked on insert).
//! 2. Every edge references existing task IDs (checked on insert).
//! 3. The directed graph is acyclic (checked by [`TaskGraph::validate`],
//!    which must succeed before anything runs).

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::models::{Task, TaskState};
use crate::EngineError;

/// Tasks plus their dependency edges.
///
/// Adjacency is kept in both directions so successor and predecessor
/// lookups are single map hits.  Ordered sets keep every listing in task-id
/// order, which makes scheduling decisions reproducible.
#[derive(Debug, Default, Clone)]
pub struct TaskGraph {
    tasks: BTreeMap<String, Task>,
    successors: HashMap<String, BTreeSet<String>>,
    predecessors: HashMap<String, BTreeSet<String>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task.
    ///
    /// # Errors
    /// [`EngineError::DuplicateTaskId`] if the id is already taken.
    pub fn add_task(&mut self, task: Task) -> Result<(), EngineError> {
        if self.tasks.contains_key(&task.id) {
            return Err(EngineError::DuplicateTaskId(task.id));
        }
        self.successors.insert(task.id.clone(), BTreeSet::new());
        self.predecessors.insert(task.id.clone(), BTreeSet::new());
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Declare that `downstream` depends on `upstream`.
    ///
    /// Adding the same edge twice is a no-op.
    ///
    /// # Errors
    /// [`EngineError::UnknownTask`] if either id is not in the graph.
    pub fn add_edge(&mut self, upstream: &str, downstream: &str) -> Result<(), EngineError> {
        for (id, side) in [(upstream, "from"), (downstream, "to")] {
            if !self.tasks.contains_key(id) {
                return Err(EngineError::UnknownTask {
                    task_id: id.to_owned(),
                    side,
                });
            }
        }
        self.successors
            .entry(upstream.to_owned())
            .or_default()
            .insert(downstream.to_owned());
        self.predecessors
            .entry(downstream.to_owned())
            .or_default()
            .insert(upstream.to_owned());
        Ok(())
    }

    /// Make every task in `downstreams` depend on every task in `upstreams`.
    pub fn add_edges<U, D>(&mut self, upstreams: &[U], downstreams: &[D]) -> Result<(), EngineError>
    where
        U: AsRef<str>,
        D: AsRef<str>,
    {
        for up in upstreams {
            for down in downstreams {
                self.add_edge(up.as_ref(), down.as_ref())?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// All tasks in id order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// Tasks that must succeed before `id` may run.
    pub fn direct_predecessors(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.predecessors.get(id)
    }

    /// Tasks that depend directly on `id`.
    pub fn direct_successors(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.successors.get(id)
    }

    /// Tasks with no predecessors.
    pub fn roots(&self) -> Vec<&str> {
        self.task_ids()
            .filter(|id| self.predecessors.get(*id).map_or(true, BTreeSet::is_empty))
            .collect()
    }

    /// Every task reachable from `id` through downstream edges, excluding
    /// `id` itself.
    pub fn downstream_of(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);

        while let Some(current) = queue.pop_front() {
            if let Some(next) = self.successors.get(current) {
                for succ in next {
                    if seen.insert(succ.clone()) {
                        queue.push_back(succ.as_str());
                    }
                }
            }
        }

        seen.remove(id);
        seen
    }

    /// Check the graph is acyclic and return a topological order.
    ///
    /// Kahn's algorithm, always taking the lexically smallest ready id, so
    /// the same graph yields the same order on every call.
    ///
    /// # Errors
    /// [`EngineError::CycleDetected`] naming a task that lies on a cycle.
    pub fn validate(&self) -> Result<Vec<String>, EngineError> {
        let mut in_degree: HashMap<&str, usize> = self
            .tasks
            .keys()
            .map(|id| (id.as_str(), self.predecessors.get(id).map_or(0, BTreeSet::len)))
            .collect();

        // Seed with tasks that have no incoming edges.
        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut sorted: Vec<String> = Vec::with_capacity(self.tasks.len());

        while let Some(id) = ready.pop_first() {
            sorted.push(id.to_owned());

            if let Some(next) = self.successors.get(id) {
                for succ in next {
                    if let Some(deg) = in_degree.get_mut(succ.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.insert(succ.as_str());
                        }
                    }
                }
            }
        }

        if sorted.len() != self.tasks.len() {
            let remaining: BTreeSet<&str> = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(id, _)| id)
                .collect();
            return Err(EngineError::CycleDetected {
                task_id: self.cycle_member(&remaining),
            });
        }

        Ok(sorted)
    }

    /// Group tasks into levels: each task sits one level below its deepest
    /// predecessor.  Tasks within a level are independent of each other.
    pub fn levels(&self) -> Result<Vec<Vec<String>>, EngineError> {
        let order = self.validate()?;
        let mut depth: HashMap<&str, usize> = HashMap::with_capacity(order.len());
        let mut levels: Vec<Vec<String>> = Vec::new();

        for id in &order {
            let level = self
                .predecessors
                .get(id)
                .into_iter()
                .flatten()
                .filter_map(|p| depth.get(p.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(id.as_str(), level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(id.clone());
        }

        for level in &mut levels {
            level.sort();
        }
        Ok(levels)
    }

    /// Pending tasks whose predecessors have all succeeded, in id order.
    ///
    /// Tasks absent from `states` count as pending.
    pub fn ready_tasks(&self, states: &HashMap<String, TaskState>) -> Vec<String> {
        let state_of = |id: &str| states.get(id).copied().unwrap_or(TaskState::Pending);

        self.tasks
            .keys()
            .filter(|id| state_of(id) == TaskState::Pending)
            .filter(|id| {
                self.predecessors
                    .get(id.as_str())
                    .into_iter()
                    .flatten()
                    .all(|p| state_of(p) == TaskState::Succeeded)
            })
            .cloned()
            .collect()
    }

    /// Walk predecessors inside the unsorted remainder of a failed Kahn pass
    /// until an id repeats; that id is on a cycle.  Every remaining task has
    /// at least one remaining predecessor, so the walk cannot dead-end.
    fn cycle_member(&self, remaining: &BTreeSet<&str>) -> String {
        let Some(&start) = remaining.first() else {
            return String::new();
        };
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut current = start;

        while visited.insert(current) {
            let next = self
                .predecessors
                .get(current)
                .into_iter()
                .flatten()
                .map(String::as_str)
                .find(|p| remaining.contains(p));
            match next {
                Some(p) => current = p,
                None => break,
            }
        }

        current.to_owned()
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use nodes::NoOp;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn make_graph(ids: &[&str], edges: &[(&str, &str)]) -> TaskGraph {
        let mut graph = TaskGraph::new();
        for id in ids {
            graph.add_task(Task::new(*id, Arc::new(NoOp))).unwrap();
        }
        for (from, to) in edges {
            graph.add_edge(from, to).unwrap();
        }
        graph
    }

    fn states(pairs: &[(&str, TaskState)]) -> HashMap<String, TaskState> {
        pairs.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    #[test]
    fn valid_linear_dag_returns_sorted_order() {
        // A → B → C
        let graph = make_graph(&["c", "b", "a"], &[("a", "b"), ("b", "c")]);
        assert_eq!(graph.validate().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn valid_diamond_dag() {
        //   A
        //  / \
        // B   C
        //  \ /
        //   D
        let graph = make_graph(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        assert_eq!(graph.validate().unwrap(), vec!["a", "b", "c", "d"]);
        assert_eq!(graph.levels().unwrap(), vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn duplicate_task_id_is_rejected() {
        let mut graph = make_graph(&["a"], &[]);
        assert!(matches!(
            graph.add_task(Task::new("a", Arc::new(NoOp))),
            Err(EngineError::DuplicateTaskId(id)) if id == "a"
        ));
    }

    #[test]
    fn edge_referencing_missing_task_is_rejected() {
        let mut graph = make_graph(&["a"], &[]);
        assert!(matches!(
            graph.add_edge("a", "ghost"),
            Err(EngineError::UnknownTask { task_id, side: "to" }) if task_id == "ghost"
        ));
        assert!(matches!(
            graph.add_edge("ghost", "a"),
            Err(EngineError::UnknownTask { side: "from", .. })
        ));
    }

    #[test]
    fn cycle_is_detected_and_named() {
        // A → B → C → A, with D hanging off the cycle.
        let graph = make_graph(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("b", "c"), ("c", "a"), ("c", "d")],
        );
        match graph.validate() {
            Err(EngineError::CycleDetected { task_id }) => {
                assert!(["a", "b", "c"].contains(&task_id.as_str()), "got {task_id}");
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn cycle_member_is_found_when_only_downstream_sorts_first() {
        // "a" is downstream of the b ⇄ c cycle and sorts first lexically.
        let graph = make_graph(&["a", "b", "c"], &[("b", "c"), ("c", "b"), ("c", "a")]);
        match graph.validate() {
            Err(EngineError::CycleDetected { task_id }) => {
                assert!(task_id == "b" || task_id == "c", "got {task_id}");
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let graph = make_graph(&["solo"], &[("solo", "solo")]);
        assert!(matches!(
            graph.validate(),
            Err(EngineError::CycleDetected { task_id }) if task_id == "solo"
        ));
    }

    #[test]
    fn validate_is_idempotent() {
        let graph = make_graph(&["x", "y", "z"], &[("x", "z"), ("y", "z")]);
        assert_eq!(graph.validate().unwrap(), graph.validate().unwrap());
    }

    #[test]
    fn duplicate_edges_are_ignored() {
        let graph = make_graph(&["a", "b"], &[("a", "b"), ("a", "b")]);
        assert_eq!(graph.direct_predecessors("b").unwrap().len(), 1);
        assert_eq!(graph.validate().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn ready_requires_every_predecessor_succeeded() {
        let graph = make_graph(&["a", "b", "c"], &[("a", "c"), ("b", "c")]);

        assert_eq!(graph.ready_tasks(&HashMap::new()), vec!["a", "b"]);

        let partial = states(&[
            ("a", TaskState::Succeeded),
            ("b", TaskState::Running),
            ("c", TaskState::Pending),
        ]);
        assert!(graph.ready_tasks(&partial).is_empty());

        let failed = states(&[
            ("a", TaskState::Succeeded),
            ("b", TaskState::Failed),
            ("c", TaskState::Pending),
        ]);
        assert!(graph.ready_tasks(&failed).is_empty());

        let done = states(&[
            ("a", TaskState::Succeeded),
            ("b", TaskState::Succeeded),
            ("c", TaskState::Pending),
        ]);
        assert_eq!(graph.ready_tasks(&done), vec!["c"]);
    }

    #[test]
    fn fan_out_helpers_and_lookups() {
        let mut graph = make_graph(&["start", "x", "y", "join"], &[]);
        graph.add_edges(&["start"], &["x", "y"]).unwrap();
        graph.add_edges(&["x", "y"], &["join"]).unwrap();

        assert_eq!(graph.roots(), vec!["start"]);
        assert_eq!(
            graph.direct_successors("start").unwrap().iter().collect::<Vec<_>>(),
            vec!["x", "y"]
        );
        assert_eq!(
            graph.downstream_of("start").into_iter().collect::<Vec<_>>(),
            vec!["join", "x", "y"]
        );
        assert!(graph.downstream_of("join").is_empty());
    }

    #[test]
    fn single_task_no_edges_is_valid() {
        let graph = make_graph(&["solo"], &[]);
        assert_eq!(graph.validate().unwrap(), vec!["solo"]);
    }

    // Acyclic by construction: task i may only depend on tasks 0..i.
    fn acyclic_edges(max_tasks: usize) -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
        (1..=max_tasks).prop_flat_map(|n| {
            let edges = proptest::collection::vec((0..n, 0..n), 0..n * 2).prop_map(|pairs| {
                pairs
                    .into_iter()
                    .filter(|(a, b)| a != b)
                    .map(|(a, b)| (a.min(b), a.max(b)))
                    .collect::<Vec<_>>()
            });
            (Just(n), edges)
        })
    }

    fn build(n: usize, edges: &[(usize, usize)]) -> TaskGraph {
        let ids: Vec<String> = (0..n).map(|i| format!("t{i:02}")).collect();
        let mut graph = TaskGraph::new();
        for id in &ids {
            graph.add_task(Task::new(id.clone(), Arc::new(NoOp))).unwrap();
        }
        for (a, b) in edges {
            graph.add_edge(&ids[*a], &ids[*b]).unwrap();
        }
        graph
    }

    proptest! {
        #[test]
        fn acyclic_graphs_validate_in_dependency_order((n, edges) in acyclic_edges(12)) {
            let graph = build(n, &edges);
            let order = graph.validate().unwrap();
            prop_assert_eq!(order.len(), n);
            let pos: HashMap<&str, usize> =
                order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
            for (a, b) in &edges {
                let (a, b) = (format!("t{a:02}"), format!("t{b:02}"));
                prop_assert!(pos[a.as_str()] < pos[b.as_str()]);
            }
        }

        #[test]
        fn back_edge_creates_named_cycle((n, edges) in acyclic_edges(12)) {
            prop_assume!(!edges.is_empty());
            let mut graph = build(n, &edges);
            let (a, b) = edges[0];
            let (a, b) = (format!("t{a:02}"), format!("t{b:02}"));
            graph.add_edge(&b, &a).unwrap();

            match graph.validate() {
                Err(EngineError::CycleDetected { task_id }) => {
                    // The named task reaches itself.
                    let succs = graph.direct_successors(&task_id).unwrap();
                    prop_assert!(succs
                        .iter()
                        .any(|s| *s == task_id || graph.downstream_of(s).contains(&task_id)));
                }
                other => prop_assert!(false, "expected cycle, got {:?}", other),
            }
        }
    }
}
