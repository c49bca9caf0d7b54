//! Blueprint (execution-mode) configuration.
//!
//! Mirrors the `config::loader` shape — YAML file to typed
//! struct, with an env-var override layer applied after parsing — without
//! the `$include`/`${ENV:default}` file-composition machinery, which this
//! engine has no use for (a single flat blueprint document, not a
//! multi-file pattern registry).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::consensus::{CategoryWeights, EscalationThresholds};
use crate::error::Result;
use crate::rate_limiter::RateLimitConfig;
use crate::retry::RetryConfig;

/// Trace recording mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceMode {
    Full,
    Summary,
    Off,
}

/// The full execution-mode configuration carried on `WorkflowState.blueprint`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub category_weights: CategoryWeights,
    pub escalation_thresholds: EscalationThresholds,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub trace_mode: TraceMode,
    pub max_prompt_len: usize,
    pub overall_timeout_secs: u64,
    pub task_timeout_secs: u64,
    /// Default retention for `CleanupOldCheckpoints`; `None` is infinite
    /// retention.
    pub checkpoint_retention_days: Option<i64>,
    pub stale_heartbeat_secs: i64,
    pub default_agent: String,
    pub consolidator_agent: String,
    pub synthesis_agent: String,
    /// Base directory under which `TraceWriter` creates one subdirectory
    /// per run. Unused when `trace_mode` is `Off`.
    #[serde(default = "default_trace_dir")]
    pub trace_dir: String,
}

fn default_trace_dir() -> String {
    "./traces".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            category_weights: CategoryWeights::default(),
            escalation_thresholds: EscalationThresholds::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            trace_mode: TraceMode::Summary,
            max_prompt_len: 32_000,
            overall_timeout_secs: 1800,
            task_timeout_secs: 300,
            checkpoint_retention_days: Some(30),
            stale_heartbeat_secs: 300,
            default_agent: "claude".to_string(),
            consolidator_agent: "claude".to_string(),
            synthesis_agent: "claude".to_string(),
            trace_dir: default_trace_dir(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from a YAML file on disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            crate::error::OrchestratorError::General(format!(
                "failed to read config file {:?}: {e}",
                path.as_ref()
            ))
        })?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Start from defaults and apply whitelisted environment variable
    /// overrides, mirroring the `$include`/env-expansion loader
    /// in spirit (env wins over file, file wins over defaults).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Load from file, then apply environment variable overrides on top.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ORCHESTRATOR_MAX_PROMPT_LEN") {
            if let Ok(parsed) = v.parse() {
                self.max_prompt_len = parsed;
            }
        }
        if let Ok(v) = std::env::var("ORCHESTRATOR_OVERALL_TIMEOUT_SECS") {
            if let Ok(parsed) = v.parse() {
                self.overall_timeout_secs = parsed;
            }
        }
        if let Ok(v) = std::env::var("ORCHESTRATOR_DEFAULT_AGENT") {
            self.default_agent = v;
        }
        if let Ok(v) = std::env::var("ORCHESTRATOR_TRACE_MODE") {
            self.trace_mode = match v.to_lowercase().as_str() {
                "full" => TraceMode::Full,
                "off" => TraceMode::Off,
                _ => TraceMode::Summary,
            };
        }
    }

    pub fn checkpoint_retention(&self) -> Option<chrono::Duration> {
        self.checkpoint_retention_days.map(chrono::Duration::days)
    }

    pub fn stale_heartbeat(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_heartbeat_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.category_weights.claims, 0.40);
        assert_eq!(config.escalation_thresholds.consensus, 0.80);
        assert_eq!(config.escalation_thresholds.human_review, 0.50);
    }

    #[test]
    fn from_file_parses_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blueprint.yaml");
        std::fs::write(
            &path,
            r#"
category_weights:
  claims: 0.5
  risks: 0.25
  recommendations: 0.25
escalation_thresholds:
  consensus: 0.9
  human_review: 0.4
rate_limit:
  capacity: 20.0
  refill_per_sec: 2.0
retry:
  max_retries: 5
  base_delay_ms: 500
  max_delay_ms: 30000
  multiplier: 2.0
  jitter: 0.1
trace_mode: full
max_prompt_len: 1000
overall_timeout_secs: 60
task_timeout_secs: 30
checkpoint_retention_days: 7
stale_heartbeat_secs: 120
default_agent: claude
consolidator_agent: claude
synthesis_agent: gemini
"#,
        )
        .unwrap();

        let config = OrchestratorConfig::from_file(&path).unwrap();
        assert_eq!(config.category_weights.claims, 0.5);
        assert_eq!(config.trace_mode, TraceMode::Full);
        assert_eq!(config.synthesis_agent, "gemini");
    }

    #[test]
    fn env_override_wins_over_default() {
        std::env::set_var("ORCHESTRATOR_DEFAULT_AGENT", "codex");
        let config = OrchestratorConfig::from_env();
        assert_eq!(config.default_agent, "codex");
        std::env::remove_var("ORCHESTRATOR_DEFAULT_AGENT");
    }

    #[test]
    fn checkpoint_retention_converts_days_to_duration() {
        let config = OrchestratorConfig::default();
        assert_eq!(
            config.checkpoint_retention(),
            Some(chrono::Duration::days(30))
        );
    }
}
