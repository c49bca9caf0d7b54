//! The `Agent` capability contract.
//!
//! The runner never talks to a concrete LLM CLI directly — concrete agent
//! adapters (process spawners for specific provider CLIs) are an external
//! collaborator named only at this boundary. Everything downstream (retry,
//! rate limiting, consensus, tracing) is written against this trait and
//! the registry below.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;

/// Output format an agent is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseFormat {
    Text,
    Json,
}

/// Options accompanying a single agent invocation.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub prompt: String,
    pub format: ResponseFormat,
    pub model: Option<String>,
    pub timeout: Duration,
    pub sandboxed: bool,
    pub denied_tools: Vec<String>,
}

impl AgentOptions {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            format: ResponseFormat::Text,
            model: None,
            timeout: Duration::from_secs(300),
            sandboxed: true,
            denied_tools: Vec::new(),
        }
    }

    pub fn with_format(mut self, format: ResponseFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// The result of one agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub output: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: Option<f64>,
    pub stderr: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentResult {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: None,
            stderr: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_tokens(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }
}

/// Capabilities an agent backend advertises.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub supports_json: bool,
    pub supports_streaming: bool,
    pub supports_sandbox: bool,
}

/// An external LLM CLI wrapped behind a uniform contract. Interchangeable
/// backends implement this trait; the core never depends on a concrete one.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> AgentCapabilities;

    async fn execute(&self, opts: AgentOptions) -> Result<AgentResult>;

    /// Cheap liveness check used by [`AgentRegistry::available`].
    async fn ping(&self) -> bool {
        true
    }
}

/// Registry of configured agents, keyed by name.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<std::sync::Arc<dyn Agent>>;

    fn list(&self) -> Vec<String>;

    /// Ping-filtered subset of `list()` — agents currently reachable.
    async fn available(&self) -> Vec<String>;
}

/// A simple in-memory registry, useful for tests, the reference
/// [`crate::state_manager::InMemoryStateManager`] deployment, and as a
/// model for a host-provided registry.
#[derive(Default)]
pub struct StaticAgentRegistry {
    agents: HashMap<String, std::sync::Arc<dyn Agent>>,
}

impl StaticAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, agent: std::sync::Arc<dyn Agent>) -> Self {
        self.agents.insert(agent.name().to_string(), agent);
        self
    }
}

#[async_trait]
impl AgentRegistry for StaticAgentRegistry {
    fn get(&self, name: &str) -> Option<std::sync::Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    fn list(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    async fn available(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (name, agent) in &self.agents {
            if agent.ping().await {
                out.push(name.clone());
            }
        }
        out.sort();
        out
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A scripted agent: returns queued outputs in order, counting calls.
    pub struct ScriptedAgent {
        name: String,
        outputs: parking_lot::Mutex<Vec<Result<AgentResult>>>,
        calls: AtomicUsize,
    }

    impl ScriptedAgent {
        pub fn new(name: impl Into<String>, outputs: Vec<Result<AgentResult>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                outputs: parking_lot::Mutex::new(outputs),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> AgentCapabilities {
            AgentCapabilities {
                supports_json: true,
                supports_streaming: false,
                supports_sandbox: true,
            }
        }

        async fn execute(&self, _opts: AgentOptions) -> Result<AgentResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut guard = self.outputs.lock();
            if guard.is_empty() {
                return Ok(AgentResult::new(""));
            }
            guard.remove(0)
        }
    }
}
