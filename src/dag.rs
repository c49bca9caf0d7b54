//! Task dependency graph construction and scheduling queries.
//!
//! Plan items become a DAG of [`Task`]s. [`DagBuilder::build`] validates the
//! graph (no duplicate ids, no dangling dependencies, no cycles) and
//! produces a [`TaskGraph`] that the Execute scheduler walks level by level.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result, StateError};

/// A schedulable unit of work in the task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub agent: String,
    pub depends_on: Vec<String>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        agent: impl Into<String>,
        depends_on: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            agent: agent.into(),
            depends_on,
        }
    }
}

/// Incrementally builds a [`TaskGraph`], validating as tasks and
/// dependencies are added.
#[derive(Debug, Default)]
pub struct DagBuilder {
    tasks: HashMap<String, Task>,
    order: Vec<String>,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. Errors on a duplicate id.
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(OrchestratorError::State(StateError::DuplicateTask(
                task.id.clone(),
            )));
        }
        self.order.push(task.id.clone());
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Add a dependency edge `task depends_on dependency`. Idempotent: adding
    /// the same edge twice is a no-op. Errors if either task is unknown.
    pub fn add_dependency(&mut self, task_id: &str, dependency_id: &str) -> Result<()> {
        if !self.tasks.contains_key(dependency_id) {
            return Err(OrchestratorError::State(StateError::MissingTask(
                dependency_id.to_string(),
            )));
        }
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::State(StateError::MissingTask(task_id.to_string())))?;
        if !task.depends_on.iter().any(|d| d == dependency_id) {
            task.depends_on.push(dependency_id.to_string());
        }
        Ok(())
    }

    /// Validate and finalize the graph: checks every `depends_on` reference
    /// resolves, computes a topological order via Kahn's algorithm (stable,
    /// tie-broken by insertion order), and detects cycles.
    pub fn build(self) -> Result<TaskGraph> {
        for task in self.tasks.values() {
            for dep in &task.depends_on {
                if !self.tasks.contains_key(dep) {
                    return Err(OrchestratorError::State(StateError::MissingTask(
                        dep.clone(),
                    )));
                }
            }
        }

        let mut in_degree: HashMap<String, usize> = self
            .tasks
            .keys()
            .map(|id| (id.clone(), 0usize))
            .collect();
        let mut dependents: HashMap<String, Vec<String>> =
            self.tasks.keys().map(|id| (id.clone(), Vec::new())).collect();

        for task in self.tasks.values() {
            *in_degree.get_mut(&task.id).unwrap() = task.depends_on.len();
            for dep in &task.depends_on {
                dependents.get_mut(dep).unwrap().push(task.id.clone());
            }
        }

        // Stable tie-break: process ready tasks in original insertion order.
        let mut frontier: VecDeque<String> = self
            .order
            .iter()
            .filter(|id| in_degree[*id] == 0)
            .cloned()
            .collect();

        let mut topo_order = Vec::with_capacity(self.tasks.len());
        let mut levels: HashMap<String, usize> = HashMap::new();
        let mut remaining = in_degree.clone();

        let mut level = 0usize;
        while !frontier.is_empty() {
            let mut next_frontier = VecDeque::new();
            // Drain in insertion order for determinism within a level.
            let mut this_level: Vec<String> = frontier.drain(..).collect();
            this_level.sort_by_key(|id| self.order.iter().position(|o| o == id).unwrap());

            for id in &this_level {
                levels.insert(id.clone(), level);
                topo_order.push(id.clone());
                for dependent in &dependents[id] {
                    let deg = remaining.get_mut(dependent).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        next_frontier.push_back(dependent.clone());
                    }
                }
            }

            frontier = next_frontier;
            level += 1;
        }

        if topo_order.len() != self.tasks.len() {
            let stuck: Vec<String> = self
                .tasks
                .keys()
                .filter(|id| !topo_order.contains(id))
                .cloned()
                .collect();
            return Err(OrchestratorError::State(StateError::CycleDetected(stuck)));
        }

        Ok(TaskGraph {
            tasks: self.tasks,
            order: self.order,
            topo_order,
            levels,
        })
    }
}

/// A validated, acyclic task graph ready for level-by-level execution.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: HashMap<String, Task>,
    order: Vec<String>,
    topo_order: Vec<String>,
    levels: HashMap<String, usize>,
}

impl TaskGraph {
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in a valid topological order (stable, insertion-order tie-break).
    pub fn topological_order(&self) -> &[String] {
        &self.topo_order
    }

    /// The 0-indexed level of a task: the length of its longest dependency
    /// chain. Tasks with no dependencies are level 0.
    pub fn level_of(&self, id: &str) -> Option<usize> {
        self.levels.get(id).copied()
    }

    /// Number of levels in the graph.
    pub fn level_count(&self) -> usize {
        self.levels.values().copied().max().map_or(0, |m| m + 1)
    }

    /// All tasks at a given level, in original insertion order.
    pub fn tasks_at_level(&self, level: usize) -> Vec<&Task> {
        self.order
            .iter()
            .filter(|id| self.levels.get(*id) == Some(&level))
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }

    /// Tasks whose dependencies are all in `completed` and which are not
    /// themselves already in `completed`.
    pub fn ready_tasks(&self, completed: &HashSet<String>) -> Vec<&Task> {
        self.order
            .iter()
            .filter(|id| !completed.contains(*id))
            .filter_map(|id| self.tasks.get(id))
            .filter(|task| task.depends_on.iter().all(|dep| completed.contains(dep)))
            .collect()
    }

    pub fn all_task_ids(&self) -> Vec<String> {
        self.order.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(
            id,
            format!("do {id}"),
            "agent1",
            deps.iter().map(|d| d.to_string()).collect(),
        )
    }

    #[test]
    fn chain_graph_has_sequential_levels() {
        let mut builder = DagBuilder::new();
        builder.add_task(task("a", &[])).unwrap();
        builder.add_task(task("b", &["a"])).unwrap();
        builder.add_task(task("c", &["b"])).unwrap();
        let graph = builder.build().unwrap();

        assert_eq!(graph.level_of("a"), Some(0));
        assert_eq!(graph.level_of("b"), Some(1));
        assert_eq!(graph.level_of("c"), Some(2));
        assert_eq!(graph.level_count(), 3);
    }

    #[test]
    fn diamond_graph_merges_levels_correctly() {
        let mut builder = DagBuilder::new();
        builder.add_task(task("a", &[])).unwrap();
        builder.add_task(task("b", &["a"])).unwrap();
        builder.add_task(task("c", &["a"])).unwrap();
        builder.add_task(task("d", &["b", "c"])).unwrap();
        let graph = builder.build().unwrap();

        assert_eq!(graph.level_of("a"), Some(0));
        assert_eq!(graph.level_of("b"), Some(1));
        assert_eq!(graph.level_of("c"), Some(1));
        assert_eq!(graph.level_of("d"), Some(2));

        let level1: HashSet<&str> = graph
            .tasks_at_level(1)
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(level1, HashSet::from(["b", "c"]));
    }

    #[test]
    fn duplicate_task_id_is_rejected() {
        let mut builder = DagBuilder::new();
        builder.add_task(task("a", &[])).unwrap();
        let err = builder.add_task(task("a", &[])).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::State(StateError::DuplicateTask(ref id)) if id == "a"
        ));
    }

    #[test]
    fn dependency_on_missing_task_is_rejected_at_build() {
        let mut builder = DagBuilder::new();
        builder.add_task(task("a", &["ghost"])).unwrap();
        let err = builder.build().unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::State(StateError::MissingTask(ref id)) if id == "ghost"
        ));
    }

    #[test]
    fn add_dependency_rejects_unknown_dependency() {
        let mut builder = DagBuilder::new();
        builder.add_task(task("a", &[])).unwrap();
        let err = builder.add_dependency("a", "ghost").unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::State(StateError::MissingTask(ref id)) if id == "ghost"
        ));
    }

    #[test]
    fn add_dependency_is_idempotent() {
        let mut builder = DagBuilder::new();
        builder.add_task(task("a", &[])).unwrap();
        builder.add_task(task("b", &[])).unwrap();
        builder.add_dependency("b", "a").unwrap();
        builder.add_dependency("b", "a").unwrap();
        let graph = builder.build().unwrap();
        assert_eq!(graph.task("b").unwrap().depends_on, vec!["a".to_string()]);
    }

    #[test]
    fn cycle_is_detected() {
        let mut builder = DagBuilder::new();
        builder.add_task(task("a", &["b"])).unwrap();
        builder.add_task(task("b", &["a"])).unwrap();
        let err = builder.build().unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::State(StateError::CycleDetected(_))
        ));
    }

    #[test]
    fn self_cycle_is_detected() {
        let mut builder = DagBuilder::new();
        builder.add_task(task("a", &["a"])).unwrap();
        let err = builder.build().unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::State(StateError::CycleDetected(_))
        ));
    }

    #[test]
    fn ready_tasks_respects_completed_set() {
        let mut builder = DagBuilder::new();
        builder.add_task(task("a", &[])).unwrap();
        builder.add_task(task("b", &["a"])).unwrap();
        builder.add_task(task("c", &["a"])).unwrap();
        let graph = builder.build().unwrap();

        let none_done: HashSet<String> = HashSet::new();
        let ready: HashSet<&str> = graph
            .ready_tasks(&none_done)
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(ready, HashSet::from(["a"]));

        let a_done: HashSet<String> = HashSet::from(["a".to_string()]);
        let ready: HashSet<&str> = graph
            .ready_tasks(&a_done)
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(ready, HashSet::from(["b", "c"]));
    }

    #[test]
    fn empty_graph_builds_fine() {
        let graph = DagBuilder::new().build().unwrap();
        assert!(graph.is_empty());
        assert_eq!(graph.level_count(), 0);
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let mut builder = DagBuilder::new();
        builder.add_task(task("c", &["b"])).unwrap();
        builder.add_task(task("b", &["a"])).unwrap();
        builder.add_task(task("a", &[])).unwrap();
        let graph = builder.build().unwrap();

        let order = graph.topological_order();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    proptest::proptest! {
        #[test]
        fn topological_order_is_always_a_valid_permutation(n in 1usize..8) {
            // Build a chain a0 -> a1 -> ... -> a(n-1) regardless of insertion
            // order permutation; topological order must still respect edges.
            let mut builder = DagBuilder::new();
            for i in 0..n {
                builder.add_task(task(&format!("t{i}"), if i == 0 { &[] } else { &[] })).unwrap();
            }
            for i in 1..n {
                builder.add_dependency(&format!("t{i}"), &format!("t{}", i - 1)).unwrap();
            }
            let graph = builder.build().unwrap();
            let order = graph.topological_order();
            proptest::prop_assert_eq!(order.len(), n);
            let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
            for i in 1..n {
                proptest::prop_assert!(pos(&format!("t{i}")) > pos(&format!("t{}", i - 1)));
            }
        }
    }
}
