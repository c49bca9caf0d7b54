//! Thread-safe metrics collection and report generation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::workflow::state::Phase;

/// Per-agent invocation counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStats {
    pub invocations: u64,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_duration_ms: u64,
}

impl AgentStats {
    pub fn avg_duration_ms(&self) -> f64 {
        if self.invocations == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.invocations as f64
        }
    }
}

/// Per-task timing/outcome record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetric {
    pub task_id: String,
    pub agent: String,
    pub duration_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// Per-round consensus-evaluation record (one Analyze sub-step).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterMetric {
    pub phase: Phase,
    pub round: u64,
    pub score: f64,
    pub divergence_count: usize,
    pub agreement_count: usize,
    pub tokens_used: u64,
    pub duration_ms: u64,
}

/// A point-in-time, deeply-copied view of all collected metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub tasks_total: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_skipped: u64,
    pub retries: u64,
    pub arbiter_rounds: u64,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub agents: HashMap<String, AgentStats>,
    pub task_metrics: Vec<TaskMetric>,
    pub arbiter_metrics: Vec<ArbiterMetric>,
}

/// Thread-safe counters collected over the lifetime of one workflow.
#[derive(Default)]
pub struct MetricsCollector {
    tasks_total: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_skipped: AtomicU64,
    retries: AtomicU64,
    arbiter_rounds: AtomicU64,
    total_tokens_in: AtomicU64,
    total_tokens_out: AtomicU64,
    agents: Mutex<HashMap<String, AgentStats>>,
    task_metrics: Mutex<Vec<TaskMetric>>,
    arbiter_metrics: Mutex<Vec<ArbiterMetric>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_task_started(&self) {
        self.tasks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_finished(&self, metric: TaskMetric) {
        match metric.success {
            true => {
                self.tasks_completed.fetch_add(1, Ordering::Relaxed);
            }
            false => {
                self.tasks_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.total_tokens_in.fetch_add(metric.tokens_in, Ordering::Relaxed);
        self.total_tokens_out.fetch_add(metric.tokens_out, Ordering::Relaxed);

        let mut agents = self.agents.lock();
        let entry = agents.entry(metric.agent.clone()).or_default();
        entry.invocations += 1;
        entry.total_tokens_in += metric.tokens_in;
        entry.total_tokens_out += metric.tokens_out;
        entry.total_duration_ms += metric.duration_ms;
        drop(agents);

        self.task_metrics.lock().push(metric);
    }

    pub fn record_task_skipped(&self) {
        self.tasks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_arbiter_round(&self, metric: ArbiterMetric) {
        self.arbiter_rounds.fetch_add(1, Ordering::Relaxed);
        self.arbiter_metrics.lock().push(metric);
    }

    pub fn record_agent_call(&self, agent: &str, tokens_in: u64, tokens_out: u64, duration: Duration) {
        self.total_tokens_in.fetch_add(tokens_in, Ordering::Relaxed);
        self.total_tokens_out.fetch_add(tokens_out, Ordering::Relaxed);
        let mut agents = self.agents.lock();
        let entry = agents.entry(agent.to_string()).or_default();
        entry.invocations += 1;
        entry.total_tokens_in += tokens_in;
        entry.total_tokens_out += tokens_out;
        entry.total_duration_ms += duration.as_millis() as u64;
    }

    /// A deep-copied, consistent-enough (not transactional across fields)
    /// view of all counters, safe to hand to callers or embed in a
    /// persisted `WorkflowState`.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_total: self.tasks_total.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_skipped: self.tasks_skipped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            arbiter_rounds: self.arbiter_rounds.load(Ordering::Relaxed),
            total_tokens_in: self.total_tokens_in.load(Ordering::Relaxed),
            total_tokens_out: self.total_tokens_out.load(Ordering::Relaxed),
            agents: self.agents.lock().clone(),
            task_metrics: self.task_metrics.lock().clone(),
            arbiter_metrics: self.arbiter_metrics.lock().clone(),
        }
    }
}

/// Render a tabular plain-text report from a snapshot.
pub fn render_text_report(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();
    out.push_str("=== Workflow Metrics ===\n\n");
    out.push_str(&format!(
        "Tasks: {} total, {} completed, {} failed, {} skipped\n",
        snapshot.tasks_total, snapshot.tasks_completed, snapshot.tasks_failed, snapshot.tasks_skipped
    ));
    out.push_str(&format!(
        "Retries: {}  Arbiter rounds: {}  Tokens in/out: {}/{}\n\n",
        snapshot.retries, snapshot.arbiter_rounds, snapshot.total_tokens_in, snapshot.total_tokens_out
    ));

    out.push_str("--- Per-agent ---\n");
    out.push_str(&format!("{:<16}{:>10}{:>14}{:>14}{:>12}\n", "agent", "calls", "tokens_in", "tokens_out", "avg_ms"));
    let mut agent_names: Vec<&String> = snapshot.agents.keys().collect();
    agent_names.sort();
    for name in agent_names {
        let stats = &snapshot.agents[name];
        out.push_str(&format!(
            "{:<16}{:>10}{:>14}{:>14}{:>12.1}\n",
            name, stats.invocations, stats.total_tokens_in, stats.total_tokens_out, stats.avg_duration_ms()
        ));
    }

    out.push_str("\n--- Per-task ---\n");
    out.push_str(&format!("{:<12}{:<16}{:>10}{:>10}\n", "task", "agent", "ms", "ok"));
    for task in &snapshot.task_metrics {
        out.push_str(&format!(
            "{:<12}{:<16}{:>10}{:>10}\n",
            task.task_id, task.agent, task.duration_ms, task.success
        ));
    }

    out.push_str("\n--- Per-arbiter ---\n");
    out.push_str(&format!(
        "{:<10}{:>8}{:>10}{:>12}{:>12}\n",
        "phase", "round", "score", "divergent", "agreed"
    ));
    for arbiter in &snapshot.arbiter_metrics {
        out.push_str(&format!(
            "{:<10}{:>8}{:>10.2}{:>12}{:>12}\n",
            format!("{:?}", arbiter.phase),
            arbiter.round,
            arbiter.score,
            arbiter.divergence_count,
            arbiter.agreement_count
        ));
    }

    out
}

/// Render a JSON report from a snapshot (just the snapshot itself,
/// serialized — db models elsewhere likewise serialize their snapshot
/// structs directly rather than building a bespoke report DTO).
pub fn render_json_report(snapshot: &MetricsSnapshot) -> crate::error::Result<String> {
    Ok(serde_json::to_string_pretty(snapshot)?)
}

/// Render a Markdown report, matching the Markdown idiom the prompt
/// templates already use.
pub fn render_markdown_report(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();
    out.push_str("# Workflow Metrics\n\n");
    out.push_str(&format!(
        "- Tasks: **{}** total, **{}** completed, **{}** failed, **{}** skipped\n",
        snapshot.tasks_total, snapshot.tasks_completed, snapshot.tasks_failed, snapshot.tasks_skipped
    ));
    out.push_str(&format!(
        "- Retries: **{}**  Arbiter rounds: **{}**  Tokens in/out: **{}/{}**\n\n",
        snapshot.retries, snapshot.arbiter_rounds, snapshot.total_tokens_in, snapshot.total_tokens_out
    ));

    out.push_str("## Per-agent\n\n| agent | calls | tokens_in | tokens_out | avg_ms |\n|---|---|---|---|---|\n");
    let mut agent_names: Vec<&String> = snapshot.agents.keys().collect();
    agent_names.sort();
    for name in agent_names {
        let stats = &snapshot.agents[name];
        out.push_str(&format!(
            "| {name} | {} | {} | {} | {:.1} |\n",
            stats.invocations, stats.total_tokens_in, stats.total_tokens_out, stats.avg_duration_ms()
        ));
    }

    out
}
