//! `WorkflowState` and `TaskState` entities.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result, StateError};
use crate::metrics::MetricsSnapshot;

/// Overall workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Pending,
    Running,
    AwaitingReview,
    Paused,
    Completed,
    Failed,
}

/// Phase within the Refine → Analyze → Plan → Execute → Done sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Refine,
    Analyze,
    Plan,
    Execute,
    Done,
}

impl Phase {
    /// The phase that follows this one in normal forward progression.
    /// `Execute` is terminal with respect to this mapping — the runner
    /// moves to `Done` only once all tasks are confirmed Completed.
    pub fn next(self) -> Phase {
        match self {
            Phase::Refine => Phase::Analyze,
            Phase::Analyze => Phase::Plan,
            Phase::Plan => Phase::Execute,
            Phase::Execute => Phase::Execute,
            Phase::Done => Phase::Done,
        }
    }
}

/// Per-task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// A task's mutable state within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    pub name: String,
    pub description: String,
    pub phase: Phase,
    pub status: TaskStatus,
    pub agent: String,
    pub model: Option<String>,
    pub depends_on: Vec<String>,
    pub retry_count: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TaskState {
    pub fn new(id: impl Into<String>, name: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            phase: Phase::Execute,
            status: TaskStatus::Pending,
            agent: agent.into(),
            model: None,
            depends_on: Vec::new(),
            retry_count: 0,
            tokens_in: 0,
            tokens_out: 0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// The full persisted state of one workflow invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    pub schema_version: u32,
    pub status: Status,
    pub current_phase: Phase,
    pub prompt: String,
    pub tasks: HashMap<String, TaskState>,
    /// Permutation of `tasks`' keys giving plan order. See
    /// [`WorkflowState::check_invariants`].
    pub task_order: Vec<String>,
    /// Append-only; never mutated once pushed.
    pub checkpoints: Vec<Checkpoint>,
    pub metrics: MetricsSnapshot,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub heartbeat: Option<DateTime<Utc>>,
    pub blueprint: OrchestratorConfig,
}

impl WorkflowState {
    pub fn new(prompt: impl Into<String>, blueprint: OrchestratorConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            schema_version: 1,
            status: Status::Pending,
            current_phase: Phase::Refine,
            prompt: prompt.into(),
            tasks: HashMap::new(),
            task_order: Vec::new(),
            checkpoints: Vec::new(),
            metrics: MetricsSnapshot::default(),
            created_at: now,
            updated_at: now,
            heartbeat: None,
            blueprint,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn beat_heart(&mut self) {
        self.heartbeat = Some(Utc::now());
    }

    /// True when `heartbeat` is older than `stale_after` while `status`
    /// is `Running` (zombie detection).
    pub fn is_zombie(&self, stale_after: chrono::Duration, now: DateTime<Utc>) -> bool {
        if self.status != Status::Running {
            return false;
        }
        match self.heartbeat {
            Some(hb) => now.signed_duration_since(hb) > stale_after,
            None => false,
        }
    }

    pub fn add_task(&mut self, task: TaskState) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(OrchestratorError::State(StateError::DuplicateTask(
                task.id.clone(),
            )));
        }
        self.task_order.push(task.id.clone());
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn push_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoints.push(checkpoint);
        self.touch();
    }

    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// `TaskOrder` is a permutation of `Tasks`' keys; `Checkpoints` is
    /// monotonic in timestamp. Verifies both.
    pub fn check_invariants(&self) -> Result<()> {
        let mut order_set: Vec<&String> = self.task_order.iter().collect();
        order_set.sort();
        order_set.dedup();
        let mut key_set: Vec<&String> = self.tasks.keys().collect();
        key_set.sort();

        if order_set != key_set || self.task_order.len() != self.tasks.len() {
            return Err(OrchestratorError::Validation(
                "task_order is not a permutation of tasks' keys".into(),
            ));
        }

        for pair in self.checkpoints.windows(2) {
            if pair[1].timestamp < pair[0].timestamp {
                return Err(OrchestratorError::Validation(
                    "checkpoints are not monotonic in timestamp".into(),
                ));
            }
        }

        Ok(())
    }

    pub fn completed_task_ids(&self) -> std::collections::HashSet<String> {
        self.tasks
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::Completed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn completed_task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .task_order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.name.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;

    #[test]
    fn phase_next_advances_forward_and_execute_is_terminal() {
        assert_eq!(Phase::Refine.next(), Phase::Analyze);
        assert_eq!(Phase::Analyze.next(), Phase::Plan);
        assert_eq!(Phase::Plan.next(), Phase::Execute);
        assert_eq!(Phase::Execute.next(), Phase::Execute);
    }

    #[test]
    fn add_task_rejects_duplicate_id() {
        let mut state = WorkflowState::new("prompt", OrchestratorConfig::default());
        state.add_task(TaskState::new("t1", "task one", "agent1")).unwrap();
        let err = state
            .add_task(TaskState::new("t1", "dup", "agent1"))
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::State(StateError::DuplicateTask(_))
        ));
    }

    #[test]
    fn invariants_hold_for_fresh_state() {
        let mut state = WorkflowState::new("prompt", OrchestratorConfig::default());
        state.add_task(TaskState::new("t1", "one", "a")).unwrap();
        state.add_task(TaskState::new("t2", "two", "a")).unwrap();
        state.check_invariants().unwrap();
    }

    #[test]
    fn zombie_detection_requires_running_and_stale_heartbeat() {
        let mut state = WorkflowState::new("prompt", OrchestratorConfig::default());
        let now = Utc::now();
        assert!(!state.is_zombie(chrono::Duration::seconds(60), now));

        state.status = Status::Running;
        state.heartbeat = Some(now - chrono::Duration::seconds(120));
        assert!(state.is_zombie(chrono::Duration::seconds(60), now));

        state.heartbeat = Some(now);
        assert!(!state.is_zombie(chrono::Duration::seconds(60), now));
    }

    #[test]
    fn completed_task_names_only_includes_completed_and_is_sorted() {
        let mut state = WorkflowState::new("prompt", OrchestratorConfig::default());
        let mut t1 = TaskState::new("t1", "zebra", "a");
        t1.status = TaskStatus::Completed;
        let mut t2 = TaskState::new("t2", "apple", "a");
        t2.status = TaskStatus::Pending;
        state.add_task(t1).unwrap();
        state.add_task(t2).unwrap();

        assert_eq!(state.completed_task_names(), vec!["zebra".to_string()]);
    }
}
