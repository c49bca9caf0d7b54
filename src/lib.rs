//! Multi-agent workflow orchestration core.
//!
//! Drives an end-user prompt through four phases — Refine, Analyze, Plan,
//! Execute — coordinating several external agent CLIs in parallel,
//! measuring their agreement, escalating disagreements, and running a
//! dependency-scheduled task graph. This crate is the back-end engine only:
//! it consumes an [`agent::Agent`] capability contract and a
//! [`state_manager::StateManager`] persistence contract rather than owning
//! process spawning or on-disk layout itself.
//!
//! ## Modules
//!
//! - [`similarity`] — Jaccard set similarity and text normalization.
//! - [`consensus`] — weighted multi-category agreement scoring and
//!   escalation decisions for the Analyze phase.
//! - [`dag`] — task graph construction, cycle detection, level sort, and
//!   ready-set queries for the Plan/Execute phases.
//! - [`retry`] — exponential backoff with jitter and retryable-error
//!   classification.
//! - [`rate_limiter`] — per-agent token buckets with adaptive modulation.
//! - [`prompt`] — embedded parameterised prompt templates.
//! - [`checkpoint`] — append-only checkpoint records and resume-point
//!   computation.
//! - [`metrics`] — per-task/per-agent/per-arbiter counters and report
//!   generation.
//! - [`trace`] — redacted, size-capped audit trace writer.
//! - [`workflow`] — the phase state machine ([`workflow::WorkflowRunner`])
//!   that composes all of the above.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod consensus;
pub mod dag;
pub mod error;
pub mod metrics;
pub mod prompt;
pub mod rate_limiter;
pub mod retry;
pub mod similarity;
pub mod state_manager;
pub mod trace;
pub mod workflow;

pub use agent::{Agent, AgentCapabilities, AgentOptions, AgentRegistry, AgentResult, StaticAgentRegistry};
pub use checkpoint::{resume_point, Checkpoint, CheckpointType, ResumePoint};
pub use config::OrchestratorConfig;
pub use consensus::{AnalysisOutput, Category, ConsensusEvaluator, ConsensusResult, Divergence};
pub use dag::{DagBuilder, Task as DagTask, TaskGraph};
pub use error::{OrchestratorError, Result, StateError};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use prompt::PromptRenderer;
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use retry::{retry_with_backoff, retry_with_backoff_notify, RetryConfig};
pub use similarity::{jaccard, normalize};
pub use state_manager::{InMemoryStateManager, StateManager};
pub use trace::TraceWriter;
pub use workflow::{parse_plan, Phase, Status, TaskState, TaskStatus, WorkflowRunner, WorkflowState};
