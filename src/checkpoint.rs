//! Checkpoint types and resume-point computation.
//!
//! Grounded on the `db::models::checkpoint::Checkpoint` shape
//! (opaque id, JSON metadata, ISO8601 timestamp) generalized to the
//! type-tagged, phase-carrying checkpoint this engine's resume logic needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::state::Phase;

/// Checkpoint type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointType {
    PhaseStart,
    PhaseComplete,
    TaskStart,
    TaskComplete,
    Consensus,
    Error,
    ModeratorRound,
    AnalysisRound,
    AnalysisComplete,
}

/// An append-only, never-mutated record marking a workflow re-entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub checkpoint_type: CheckpointType,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl Checkpoint {
    pub fn new(checkpoint_type: CheckpointType, phase: Phase, metadata: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            checkpoint_type,
            phase,
            timestamp: Utc::now(),
            metadata,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        self.metadata.get("task_id").and_then(|v| v.as_str())
    }

    pub fn round(&self) -> Option<u64> {
        self.metadata.get("round").and_then(|v| v.as_u64())
    }
}

/// Where the runner should resume, per the checkpoint resume rule table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePoint {
    /// No checkpoints at all: start Analyze from scratch.
    StartAnalyze,
    /// Restart the given phase from its beginning.
    RestartPhase(Phase),
    /// Advance to the next phase after `P` (or stay at `Execute`, terminal).
    AdvanceTo(Phase),
    /// Restart the specific task named by id.
    RestartTask(String),
    /// Resume at the same phase, with a flag telling the runner it may
    /// need to clear partial task state left by the failure.
    ResumeAfterError(Phase),
    /// Resume within Analyze at a specific round, with prior outputs
    /// carried in the checkpoint's metadata.
    ResumeAnalyzeRound { round: u64 },
}

/// Compute the resume point from the last checkpoint in a workflow,
/// per the resume rule table below.
pub fn resume_point(last: Option<&Checkpoint>) -> ResumePoint {
    let Some(checkpoint) = last else {
        return ResumePoint::StartAnalyze;
    };

    match checkpoint.checkpoint_type {
        CheckpointType::PhaseStart => ResumePoint::RestartPhase(checkpoint.phase),
        CheckpointType::PhaseComplete => ResumePoint::AdvanceTo(checkpoint.phase.next()),
        CheckpointType::TaskStart => {
            let task_id = checkpoint.task_id().unwrap_or_default().to_string();
            ResumePoint::RestartTask(task_id)
        }
        CheckpointType::Error => ResumePoint::ResumeAfterError(checkpoint.phase),
        CheckpointType::ModeratorRound | CheckpointType::AnalysisRound => {
            ResumePoint::ResumeAnalyzeRound {
                round: checkpoint.round().unwrap_or(0),
            }
        }
        CheckpointType::Consensus
        | CheckpointType::TaskComplete
        | CheckpointType::AnalysisComplete => ResumePoint::RestartPhase(checkpoint.phase),
    }
}

/// Drop checkpoints older than `now - retention`, preserving order.
/// Returns the number of entries dropped. Retention of `None` (infinite)
/// is a no-op.
pub fn cleanup_old_checkpoints(
    checkpoints: &mut Vec<Checkpoint>,
    retention: Option<chrono::Duration>,
    now: DateTime<Utc>,
) -> usize {
    let Some(retention) = retention else {
        return 0;
    };

    let cutoff = now - retention;
    let before = checkpoints.len();
    checkpoints.retain(|c| c.timestamp >= cutoff);
    before - checkpoints.len()
}
