//! Error taxonomy for the orchestrator core.
//!
//! Every error produced by this crate is classified by *kind*, not by
//! parsing a message string: callers that need to decide whether to retry
//! (see [`crate::retry`]) match on [`OrchestratorError::is_retryable`]
//! rather than grepping `Display` output.

use thiserror::Error;

/// Errors produced by the orchestration core.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed input or an unknown-agent reference. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing or inconsistent prerequisite state.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// An agent reported failure executing a step or task.
    #[error("execution error ({transient}): {message}")]
    Execution { message: String, transient: bool },

    /// Retryable: the agent or a downstream provider rate-limited us.
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// Retryable: a call exceeded its bounded timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Retryable: a transient network failure.
    #[error("network error: {0}")]
    Network(String),

    /// A dry-run invocation hit a step that requires a real agent call.
    /// Never retried.
    #[error("dry-run blocked: {0}")]
    DryRunBlocked(String),

    /// All configured retry attempts were exhausted.
    #[error("retry exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<OrchestratorError>,
    },

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML (de)serialization failure.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic catch-all for conditions that do not fit a more specific
    /// variant. New call sites should prefer a typed variant over this one.
    #[error("orchestrator error: {0}")]
    General(String),
}

/// Sub-taxonomy for `State` errors — missing or inconsistent prerequisites.
/// Never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("no persisted state found for workflow {0}")]
    NoState(String),

    #[error("missing consolidated analysis checkpoint; cannot enter Plan phase")]
    MissingAnalysis,

    #[error("execution is stuck: {completed}/{total} tasks completed but no task is ready")]
    ExecutionStuck { completed: usize, total: usize },

    #[error("cycle detected among tasks: {0:?}")]
    CycleDetected(Vec<String>),

    #[error("duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("dependency references unknown task: {0}")]
    MissingTask(String),

    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("workflow heartbeat is stale; treating as zombie")]
    StaleHeartbeat,
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Classify whether retrying this error could plausibly succeed.
    ///
    /// This is the typed replacement for message-sniffing classification:
    /// every retryable variant is retryable by construction, not by regex.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::RateLimit(_)
                | OrchestratorError::Timeout(_)
                | OrchestratorError::Network(_)
        ) || matches!(self, OrchestratorError::Execution { transient: true, .. })
    }

    /// Convenience constructor for a transient execution failure.
    pub fn execution_transient(message: impl Into<String>) -> Self {
        OrchestratorError::Execution {
            message: message.into(),
            transient: true,
        }
    }

    /// Convenience constructor for a permanent execution failure.
    pub fn execution_permanent(message: impl Into<String>) -> Self {
        OrchestratorError::Execution {
            message: message.into(),
            transient: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_variants() {
        assert!(OrchestratorError::RateLimit("x".into()).is_retryable());
        assert!(OrchestratorError::Timeout("x".into()).is_retryable());
        assert!(OrchestratorError::Network("x".into()).is_retryable());
        assert!(OrchestratorError::execution_transient("x").is_retryable());
    }

    #[test]
    fn non_retryable_variants() {
        assert!(!OrchestratorError::Validation("x".into()).is_retryable());
        assert!(!OrchestratorError::DryRunBlocked("x".into()).is_retryable());
        assert!(!OrchestratorError::execution_permanent("x").is_retryable());
        assert!(!OrchestratorError::State(StateError::NoState("w1".into())).is_retryable());
    }

    #[test]
    fn retry_exhausted_wraps_source() {
        let err = OrchestratorError::RetryExhausted {
            attempts: 3,
            source: Box::new(OrchestratorError::Timeout("slow".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("timeout"));
    }
}
