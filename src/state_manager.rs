//! The `StateManager` capability contract and an in-memory
//! reference implementation used by tests and the example binary.
//!
//! Concrete on-disk persistence is out of scope for the core:
//! the runner only depends on this trait, the way it depends on `Agent`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{OrchestratorError, Result, StateError};
use crate::workflow::state::{Status, WorkflowState};

/// An exclusive, per-workflow lock held for the whole `Run`/`Resume`
/// (single-writer workflow state).
pub type WorkflowLock = OwnedMutexGuard<()>;

/// Capability the runner uses to persist and recover `WorkflowState`.
/// Any I/O layer satisfying this trait is acceptable.
#[async_trait]
pub trait StateManager: Send + Sync {
    async fn save(&self, state: &WorkflowState) -> Result<()>;

    async fn load(&self, workflow_id: &str) -> Result<WorkflowState>;

    /// Load by an externally-assigned identifier, when it differs from the
    /// internal `WorkflowID` (e.g. a client-supplied idempotency key).
    async fn load_by_id(&self, id: &str) -> Result<WorkflowState>;

    async fn list_workflows(&self) -> Result<Vec<String>>;

    /// Acquire the exclusive per-workflow lock for the duration of one
    /// `Run`/`Resume` invocation.
    async fn lock(&self, workflow_id: &str) -> Arc<Mutex<()>>;

    async fn update_heartbeat(&self, workflow_id: &str) -> Result<()>;

    /// Workflows whose heartbeat is older than `stale_after` while
    /// `status == Running`.
    async fn zombie_workflows(&self, stale_after: chrono::Duration) -> Result<Vec<String>>;

    /// Run `f` against a freshly-loaded state and persist the result
    /// atomically: either both the in-memory mutation and the save
    /// succeed, or neither is observed by subsequent loads.
    async fn transact<F>(&self, workflow_id: &str, f: F) -> Result<WorkflowState>
    where
        F: FnOnce(&mut WorkflowState) -> Result<()> + Send;
}

/// In-memory reference `StateManager`, suitable for tests and the example
/// binary. Not persistent across process restarts.
#[derive(Default)]
pub struct InMemoryStateManager {
    states: DashMap<String, WorkflowState>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl InMemoryStateManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateManager for InMemoryStateManager {
    async fn save(&self, state: &WorkflowState) -> Result<()> {
        self.states.insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<WorkflowState> {
        self.states
            .get(workflow_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| OrchestratorError::State(StateError::NoState(workflow_id.to_string())))
    }

    async fn load_by_id(&self, id: &str) -> Result<WorkflowState> {
        self.load(id).await
    }

    async fn list_workflows(&self) -> Result<Vec<String>> {
        Ok(self.states.iter().map(|e| e.key().clone()).collect())
    }

    async fn lock(&self, workflow_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn update_heartbeat(&self, workflow_id: &str) -> Result<()> {
        let mut entry = self
            .states
            .get_mut(workflow_id)
            .ok_or_else(|| OrchestratorError::State(StateError::NoState(workflow_id.to_string())))?;
        entry.heartbeat = Some(Utc::now());
        Ok(())
    }

    async fn zombie_workflows(&self, stale_after: chrono::Duration) -> Result<Vec<String>> {
        let now = Utc::now();
        Ok(self
            .states
            .iter()
            .filter(|e| e.value().status == Status::Running && e.value().is_zombie(stale_after, now))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn transact<F>(&self, workflow_id: &str, f: F) -> Result<WorkflowState>
    where
        F: FnOnce(&mut WorkflowState) -> Result<()> + Send,
    {
        let mut state = self.load(workflow_id).await?;
        f(&mut state)?;
        self.save(&state).await?;
        Ok(state)
    }
}

/// Snapshot helper: collect every workflow currently known, keyed by id.
/// Used by host binaries wanting a cheap listing without touching the
/// underlying storage representation.
pub async fn snapshot_all(manager: &dyn StateManager) -> Result<HashMap<String, WorkflowState>> {
    let mut out = HashMap::new();
    for id in manager.list_workflows().await? {
        out.insert(id.clone(), manager.load(&id).await?);
    }
    Ok(out)
}
