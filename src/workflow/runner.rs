//! The phase state machine composing every other component.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use serde_json::json;
use tracing::warn;

use crate::agent::{Agent, AgentOptions, AgentRegistry, ResponseFormat};
use crate::checkpoint::{resume_point, Checkpoint, CheckpointType, ResumePoint};
use crate::config::OrchestratorConfig;
use crate::consensus::{AnalysisOutput, ConsensusEvaluator, ConsensusResult};
use crate::dag::{DagBuilder, Task as DagTask};
use crate::error::{OrchestratorError, Result, StateError};
use crate::metrics::{ArbiterMetric, MetricsCollector, TaskMetric};
use crate::prompt::PromptRenderer;
use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::retry::{retry_with_backoff, retry_with_backoff_notify};
use crate::state_manager::StateManager;
use crate::trace::{RecordEvent, TraceWriter};
use crate::workflow::state::{Phase, Status, TaskState, TaskStatus, WorkflowState};

/// Top-level composition of every component.
pub struct WorkflowRunner {
    registry: Arc<dyn AgentRegistry>,
    state_manager: Arc<dyn StateManager>,
    renderer: PromptRenderer,
    rate_limiter: RateLimiter,
    metrics: MetricsCollector,
    config: OrchestratorConfig,
    dry_run: bool,
}

impl WorkflowRunner {
    pub fn new(
        registry: Arc<dyn AgentRegistry>,
        state_manager: Arc<dyn StateManager>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        Ok(Self {
            rate_limiter: RateLimiter::new(config.rate_limit),
            renderer: PromptRenderer::new()?,
            registry,
            state_manager,
            metrics: MetricsCollector::new(),
            config,
            dry_run: false,
        })
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Opens (or reopens, for a resumed run) the audit trace for a
    /// workflow. One run directory per workflow id; `record` is a no-op
    /// once `trace_mode` is `Off`.
    fn open_trace(&self, state: &WorkflowState) -> TraceWriter {
        let config_json = serde_json::to_value(&self.config).unwrap_or_else(|_| json!({}));
        TraceWriter::start_run(
            &self.config.trace_dir,
            &state.id,
            &state.id,
            state.prompt.len(),
            self.config.trace_mode,
            &config_json,
        )
    }

    /// `Run(prompt)`: validate, lock, create, execute phases in sequence.
    pub async fn run(&self, prompt: &str) -> Result<WorkflowState> {
        self.validate_input(prompt).await?;

        let mut state = WorkflowState::new(prompt, self.config.clone_config());
        state.status = Status::Running;
        state.beat_heart();
        self.state_manager.save(&state).await?;

        let lock = self.state_manager.lock(&state.id).await;
        let _guard = lock.lock_owned().await;

        let trace = self.open_trace(&state);
        self.drive_to_completion(&mut state, Phase::Analyze, &trace).await?;
        Ok(state)
    }

    /// Resume entry point.
    pub async fn resume(&self, workflow_id: &str) -> Result<WorkflowState> {
        let mut state = self.state_manager.load(workflow_id).await?;
        let lock = self.state_manager.lock(workflow_id).await;
        let _guard = lock.lock_owned().await;

        let start_phase = match resume_point(state.last_checkpoint()) {
            ResumePoint::StartAnalyze => Phase::Analyze,
            ResumePoint::RestartPhase(phase) => phase,
            ResumePoint::AdvanceTo(phase) => phase,
            ResumePoint::RestartTask(_) => Phase::Execute,
            ResumePoint::ResumeAfterError(phase) => phase,
            ResumePoint::ResumeAnalyzeRound { .. } => Phase::Analyze,
        };

        state.status = Status::Running;
        state.beat_heart();

        let trace = self.open_trace(&state);
        self.drive_to_completion(&mut state, start_phase, &trace).await?;
        Ok(state)
    }

    /// Runs the phase loop under the configured overall timeout, bringing
    /// the workflow to `Completed` or `Failed` and persisting either way.
    async fn drive_to_completion(
        &self,
        state: &mut WorkflowState,
        start_phase: Phase,
        trace: &TraceWriter,
    ) -> Result<()> {
        let budget = std::time::Duration::from_secs(self.config.overall_timeout_secs);

        let outcome = tokio::time::timeout(budget, self.run_phases(state, start_phase, trace)).await;

        match outcome {
            Ok(Ok(())) => {
                state.status = Status::Completed;
                state.current_phase = Phase::Done;
                state.metrics = self.metrics.snapshot();
                self.state_manager.save(state).await?;
                Ok(())
            }
            Ok(Err(e)) => {
                self.fail_workflow(state, &e).await;
                Err(e)
            }
            Err(_) => {
                let e = OrchestratorError::Timeout(format!(
                    "workflow exceeded overall timeout of {}s",
                    self.config.overall_timeout_secs
                ));
                self.fail_workflow(state, &e).await;
                Err(e)
            }
        }
    }

    /// `reap_zombies`: mark stale Running workflows Failed.
    pub async fn reap_zombies(&self) -> Result<Vec<String>> {
        let stale_after = self.config.stale_heartbeat();
        let zombie_ids = self.state_manager.zombie_workflows(stale_after).await?;

        for id in &zombie_ids {
            self.state_manager
                .transact(id, |state| {
                    state.status = Status::Failed;
                    state.push_checkpoint(Checkpoint::new(
                        CheckpointType::Error,
                        state.current_phase,
                        json!({"reason": "stale_heartbeat"}),
                    ));
                    Ok(())
                })
                .await?;
        }

        Ok(zombie_ids)
    }

    pub fn cleanup_old_checkpoints(&self, state: &mut WorkflowState) -> usize {
        crate::checkpoint::cleanup_old_checkpoints(
            &mut state.checkpoints,
            self.config.checkpoint_retention(),
            chrono::Utc::now(),
        )
    }

    async fn validate_input(&self, prompt: &str) -> Result<()> {
        if prompt.trim().is_empty() {
            return Err(OrchestratorError::Validation("prompt must not be empty".into()));
        }
        if prompt.len() > self.config.max_prompt_len {
            return Err(OrchestratorError::Validation(format!(
                "prompt exceeds max length of {} bytes",
                self.config.max_prompt_len
            )));
        }
        if self.registry.available().await.is_empty() {
            return Err(OrchestratorError::Validation(
                "no agents are available".into(),
            ));
        }
        Ok(())
    }

    async fn fail_workflow(&self, state: &mut WorkflowState, error: &OrchestratorError) {
        state.push_checkpoint(Checkpoint::new(
            CheckpointType::Error,
            state.current_phase,
            json!({
                "error": error.to_string(),
                "transient": error.is_retryable(),
            }),
        ));
        state.status = Status::Failed;
        state.metrics = self.metrics.snapshot();
        if let Err(save_err) = self.state_manager.save(state).await {
            warn!(error = %save_err, "best-effort save after fatal error also failed");
        }
    }

    async fn run_phases(&self, state: &mut WorkflowState, start_phase: Phase, trace: &TraceWriter) -> Result<()> {
        let mut phase = start_phase;
        loop {
            match phase {
                Phase::Refine => {
                    // Refine is reserved, the
                    // runner currently advances straight through it.
                    phase = Phase::Analyze;
                }
                Phase::Analyze => {
                    self.run_analyze(state, trace).await?;
                    phase = Phase::Plan;
                }
                Phase::Plan => {
                    self.run_plan(state, trace).await?;
                    phase = Phase::Execute;
                }
                Phase::Execute => {
                    self.run_execute(state, trace).await?;
                    return Ok(());
                }
                Phase::Done => return Ok(()),
            }
        }
    }

    // ---- Analyze -----------------------------------------------------

    async fn run_analyze(&self, state: &mut WorkflowState, trace: &TraceWriter) -> Result<()> {
        state.current_phase = Phase::Analyze;
        state.push_checkpoint(Checkpoint::new(CheckpointType::PhaseStart, Phase::Analyze, json!({})));

        let available = self.registry.available().await;
        let v1_agents: Vec<String> = available.into_iter().take(2).collect();

        let mut outputs = self
            .run_analyze_round(state, &v1_agents, "v1_analyze", None, trace)
            .await?;
        let mut consensus = self.evaluate_and_record(state, &outputs, 1)?;

        if consensus.needs_refinement || consensus.needs_human_review {
            let v2_outputs = self.run_v2_critique(state, &outputs, trace).await?;
            outputs.extend(v2_outputs);
            consensus = self.evaluate_and_record(state, &outputs, 2)?;

            if consensus.needs_refinement || consensus.needs_human_review {
                self.run_v3_reconciliation(state, &outputs, &consensus, trace).await?;
            }
        }

        self.consolidate(state, &outputs, trace).await?;

        state.push_checkpoint(Checkpoint::new(CheckpointType::PhaseComplete, Phase::Analyze, json!({})));
        self.state_manager.save(state).await?;
        Ok(())
    }

    async fn run_analyze_round(
        &self,
        state: &WorkflowState,
        agents: &[String],
        template: &str,
        extra_params: Option<HashMap<String, String>>,
        trace: &TraceWriter,
    ) -> Result<Vec<AnalysisOutput>> {
        if agents.is_empty() {
            return Ok(Vec::new());
        }

        let futures = agents.iter().map(|agent_name| {
            let mut params = extra_params.clone().unwrap_or_default();
            params.insert("prompt".to_string(), state.prompt.clone());
            self.invoke_agent_for_analysis(agent_name.clone(), template.to_string(), params, trace)
        });

        // First-error semantics: one agent failure aborts the whole round,
        // every output is required for consensus.
        try_join_all(futures).await
    }

    async fn invoke_agent_for_analysis(
        &self,
        agent_name: String,
        template: String,
        params: HashMap<String, String>,
        trace: &TraceWriter,
    ) -> Result<AnalysisOutput> {
        let agent = self
            .registry
            .get(&agent_name)
            .ok_or_else(|| OrchestratorError::Validation(format!("unknown agent '{agent_name}'")))?;

        let rendered = self.renderer.render(&template, &params)?;
        let raw = self
            .call_agent_with_retry(agent.as_ref(), &rendered, trace, "analyze", &template, None, None)
            .await?;

        Ok(parse_analysis_output(&agent_name, &raw))
    }

    #[allow(clippy::too_many_arguments)]
    async fn call_agent_with_retry(
        &self,
        agent: &dyn Agent,
        prompt: &str,
        trace: &TraceWriter,
        phase: &str,
        step: &str,
        task_id: Option<&str>,
        task_name: Option<&str>,
    ) -> Result<String> {
        self.rate_limiter.acquire(agent.name(), 1.0).await;

        trace.record(RecordEvent {
            event_type: "prompt",
            phase,
            step,
            agent: Some(agent.name()),
            model: None,
            task_id,
            task_name,
            tokens_in: 0,
            tokens_out: 0,
            content: prompt,
            ext: "txt",
        });

        let retry_config = self.config.retry.clone();
        let opts = AgentOptions::new(prompt)
            .with_format(ResponseFormat::Json)
            .with_timeout(std::time::Duration::from_secs(self.config.task_timeout_secs));

        let result = retry_with_backoff(&retry_config, agent.name(), || async {
            if self.dry_run {
                return Err(OrchestratorError::DryRunBlocked(
                    "dry-run mode blocks real agent invocation".into(),
                ));
            }
            agent.execute(opts.clone_opts()).await
        })
        .await;

        match &result {
            Ok(_) => self.rate_limiter.record_outcome(agent.name(), false),
            Err(e) if matches!(e, OrchestratorError::RateLimit(_)) => {
                self.rate_limiter.record_outcome(agent.name(), true)
            }
            Err(_) => {}
        }

        match &result {
            Ok(r) => trace.record(RecordEvent {
                event_type: "response",
                phase,
                step,
                agent: Some(agent.name()),
                model: None,
                task_id,
                task_name,
                tokens_in: r.tokens_in,
                tokens_out: r.tokens_out,
                content: &r.output,
                ext: "txt",
            }),
            Err(e) => trace.record(RecordEvent {
                event_type: "error",
                phase,
                step,
                agent: Some(agent.name()),
                model: None,
                task_id,
                task_name,
                tokens_in: 0,
                tokens_out: 0,
                content: &e.to_string(),
                ext: "txt",
            }),
        }

        result.map(|r| r.output)
    }

    fn evaluate_and_record(&self, state: &mut WorkflowState, outputs: &[AnalysisOutput], round: u64) -> Result<ConsensusResult> {
        let evaluator = ConsensusEvaluator::new(
            self.config.category_weights,
            self.config.escalation_thresholds,
        );
        let consensus = evaluator.evaluate(outputs);

        self.metrics.record_arbiter_round(ArbiterMetric {
            phase: Phase::Analyze,
            round,
            score: consensus.overall_score,
            divergence_count: consensus.divergences.len(),
            agreement_count: consensus.agreement.iter().map(|(_, v)| v.len()).sum(),
            tokens_used: 0,
            duration_ms: 0,
        });

        state.push_checkpoint(Checkpoint::new(
            CheckpointType::Consensus,
            Phase::Analyze,
            json!({
                "round": round,
                "overall_score": consensus.overall_score,
                "needs_refinement": consensus.needs_refinement,
                "needs_human_review": consensus.needs_human_review,
            }),
        ));

        Ok(consensus)
    }

    async fn run_v2_critique(
        &self,
        state: &WorkflowState,
        v1_outputs: &[AnalysisOutput],
        trace: &TraceWriter,
    ) -> Result<Vec<AnalysisOutput>> {
        let mut futures = Vec::new();
        for (i, output) in v1_outputs.iter().enumerate() {
            let critic = v1_outputs
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, o)| o.agent.clone())
                .next()
                .unwrap_or_else(|| self.config.default_agent.clone());

            let mut params = HashMap::new();
            params.insert("prompt".to_string(), state.prompt.clone());
            params.insert("peer_agent".to_string(), output.agent.clone());
            params.insert("peer_output".to_string(), output.raw_output.clone());

            futures.push(self.invoke_agent_for_analysis(critic, "v2_critique".to_string(), params, trace));
        }

        let outputs = try_join_all(futures).await?;
        Ok(outputs)
    }

    async fn run_v3_reconciliation(
        &self,
        state: &mut WorkflowState,
        outputs: &[AnalysisOutput],
        consensus: &ConsensusResult,
        trace: &TraceWriter,
    ) -> Result<()> {
        let combined = render_combined_outputs(outputs);
        let divergence_summary: Vec<String> = consensus
            .divergences
            .iter()
            .map(|d| format!("{}: {} vs {} (score {:.2})", d.category, d.agent_a, d.agent_b, d.score))
            .collect();

        let mut params = HashMap::new();
        params.insert("prompt".to_string(), state.prompt.clone());
        params.insert("combined_outputs".to_string(), combined);
        params.insert("divergences".to_string(), divergence_summary.join("\n"));

        let rendered = self.renderer.render("v3_reconcile", &params)?;
        let agent = self
            .registry
            .get(&self.config.synthesis_agent)
            .ok_or_else(|| OrchestratorError::Validation("synthesis agent not registered".into()))?;

        let reconciled = self
            .call_agent_with_retry(agent.as_ref(), &rendered, trace, "analyze", "v3_reconcile", None, None)
            .await?;

        state.push_checkpoint(Checkpoint::new(
            CheckpointType::ModeratorRound,
            Phase::Analyze,
            json!({"round": 3, "content": reconciled}),
        ));
        Ok(())
    }

    async fn consolidate(&self, state: &mut WorkflowState, outputs: &[AnalysisOutput], trace: &TraceWriter) -> Result<()> {
        let combined = render_combined_outputs(outputs);
        let mut params = HashMap::new();
        params.insert("prompt".to_string(), state.prompt.clone());
        params.insert("combined_outputs".to_string(), combined.clone());

        let attempt = async {
            let rendered = self.renderer.render("consolidate", &params)?;
            let agent = self
                .registry
                .get(&self.config.consolidator_agent)
                .ok_or_else(|| OrchestratorError::Validation("consolidator agent not registered".into()))?;
            self.call_agent_with_retry(agent.as_ref(), &rendered, trace, "analyze", "consolidate", None, None)
                .await
        }
        .await;

        let (content, synthesized) = match attempt {
            Ok(content) => (content, true),
            Err(e) => {
                warn!(error = %e, "consolidation agent failed, falling back to raw concatenation");
                (combined, false)
            }
        };

        state.push_checkpoint(Checkpoint::new(
            CheckpointType::AnalysisComplete,
            Phase::Analyze,
            json!({"content": content, "synthesized": synthesized}),
        ));
        Ok(())
    }

    // ---- Plan ----------------------------------------------------------

    async fn run_plan(&self, state: &mut WorkflowState, trace: &TraceWriter) -> Result<()> {
        state.current_phase = Phase::Plan;
        state.push_checkpoint(Checkpoint::new(CheckpointType::PhaseStart, Phase::Plan, json!({})));

        let analysis = state
            .checkpoints
            .iter()
            .rev()
            .find(|c| c.checkpoint_type == CheckpointType::AnalysisComplete)
            .and_then(|c| c.metadata.get("content"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| OrchestratorError::State(StateError::MissingAnalysis))?;

        let valid_agents = self.registry.list();
        let mut params = HashMap::new();
        params.insert("analysis".to_string(), analysis);
        params.insert("agent_names".to_string(), valid_agents.join(", "));

        let rendered = self.renderer.render("plan", &params)?;
        let agent = self
            .registry
            .get(&self.config.default_agent)
            .ok_or_else(|| OrchestratorError::Validation("default agent not registered".into()))?;

        let raw = self
            .call_agent_with_retry(agent.as_ref(), &rendered, trace, "plan", "plan", None, None)
            .await?;
        let parsed_items = crate::workflow::plan_parser::parse_plan(&raw)?;

        let mut builder = DagBuilder::new();
        for item in &parsed_items {
            let resolved_agent =
                crate::workflow::plan_parser::resolve_agent(&item.agent, &valid_agents, &self.config.default_agent);

            let mut task_state = TaskState::new(item.id.clone(), item.name.clone(), resolved_agent.clone());
            task_state.description = item.description.clone();
            task_state.phase = Phase::Execute;
            task_state.depends_on = item.depends_on.clone();
            state.add_task(task_state)?;

            builder.add_task(DagTask::new(
                item.id.clone(),
                item.description.clone(),
                resolved_agent,
                item.depends_on.clone(),
            ))?;
        }
        builder.build()?; // validates: no cycle, no missing dependency

        state.push_checkpoint(Checkpoint::new(CheckpointType::PhaseComplete, Phase::Plan, json!({})));
        self.state_manager.save(state).await?;
        Ok(())
    }

    // ---- Execute --------------------------------------------------------

    async fn run_execute(&self, state: &mut WorkflowState, trace: &TraceWriter) -> Result<()> {
        state.current_phase = Phase::Execute;
        state.push_checkpoint(Checkpoint::new(CheckpointType::PhaseStart, Phase::Execute, json!({})));

        let mut builder = DagBuilder::new();
        for id in &state.task_order {
            let task = &state.tasks[id];
            builder.add_task(DagTask::new(task.id.clone(), task.description.clone(), task.agent.clone(), task.depends_on.clone()))?;
        }
        let graph = builder.build()?;

        let mut completed = state.completed_task_ids();

        loop {
            if completed.len() == graph.len() {
                break;
            }

            let ready: Vec<String> = graph
                .ready_tasks(&completed)
                .into_iter()
                .map(|t| t.id.clone())
                .collect();

            if ready.is_empty() {
                return Err(OrchestratorError::State(StateError::ExecutionStuck {
                    completed: completed.len(),
                    total: graph.len(),
                }));
            }

            let results = self.execute_batch(state, &ready, trace).await?;
            for id in results {
                completed.insert(id);
            }

            self.state_manager.save(state).await?;
        }

        state.push_checkpoint(Checkpoint::new(CheckpointType::PhaseComplete, Phase::Execute, json!({})));
        self.state_manager.save(state).await?;
        Ok(())
    }

    async fn execute_batch(&self, state: &mut WorkflowState, ready: &[String], trace: &TraceWriter) -> Result<Vec<String>> {
        for id in ready {
            state.push_checkpoint(Checkpoint::new(
                CheckpointType::TaskStart,
                Phase::Execute,
                json!({"task_id": id}),
            ));
            if let Some(task) = state.tasks.get_mut(id) {
                task.status = TaskStatus::Running;
                task.started_at = Some(chrono::Utc::now());
            }
        }

        let completed_names = state.completed_task_names();
        let workflow_id = state.id.clone();

        let futures = ready.iter().map(|id| {
            let id = id.clone();
            let task = state.tasks[&id].clone();
            let fut = self.execute_one_task(workflow_id.clone(), task, completed_names.clone(), trace);
            async move { fut.await.map_err(|e| (id, e)) }
        });

        // Parallel within a level, first-error aborts the batch.
        let results = match try_join_all(futures).await {
            Ok(results) => results,
            Err((failed_id, e)) => {
                if let Some(task) = state.tasks.get_mut(&failed_id) {
                    task.status = TaskStatus::Failed;
                    task.error = Some(e.to_string());
                }
                return Err(e);
            }
        };

        for (id, (tokens_in, tokens_out, retry_count)) in ready.iter().zip(results.iter()) {
            if let Some(task) = state.tasks.get_mut(id) {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(chrono::Utc::now());
                task.tokens_in = *tokens_in;
                task.tokens_out = *tokens_out;
                task.retry_count = *retry_count;
            }
            state.push_checkpoint(Checkpoint::new(
                CheckpointType::TaskComplete,
                Phase::Execute,
                json!({"task_id": id}),
            ));
        }

        Ok(ready.to_vec())
    }

    async fn execute_one_task(
        &self,
        workflow_id: String,
        task: TaskState,
        completed_task_names: Vec<String>,
        trace: &TraceWriter,
    ) -> Result<(u64, u64, u32)> {
        self.metrics.record_task_started();

        if self.dry_run {
            self.metrics.record_task_finished(TaskMetric {
                task_id: task.id.clone(),
                agent: task.agent.clone(),
                duration_ms: 0,
                tokens_in: 0,
                tokens_out: 0,
                success: true,
                error: None,
            });
            return Ok((0, 0, 0));
        }

        let agent = self
            .registry
            .get(&task.agent)
            .ok_or_else(|| OrchestratorError::Validation(format!("unknown agent '{}'", task.agent)))?;

        let mut params = HashMap::new();
        params.insert("workflow_id".to_string(), workflow_id);
        params.insert("task_name".to_string(), task.name.clone());
        params.insert("task_description".to_string(), task.description.clone());
        params.insert("completed_task_names".to_string(), completed_task_names.join(", "));

        let rendered = self.renderer.render("execute_task", &params)?;

        self.rate_limiter.acquire(agent.name(), 1.0).await;
        trace.record(RecordEvent {
            event_type: "prompt",
            phase: "execute",
            step: "execute_task",
            agent: Some(agent.name()),
            model: None,
            task_id: Some(&task.id),
            task_name: Some(&task.name),
            tokens_in: 0,
            tokens_out: 0,
            content: &rendered,
            ext: "txt",
        });

        let retry_config = self.config.retry.clone();
        let opts = AgentOptions::new(rendered)
            .with_timeout(std::time::Duration::from_secs(self.config.task_timeout_secs));

        let start = std::time::Instant::now();
        let retries_seen = std::sync::atomic::AtomicU32::new(0);
        let result = retry_with_backoff_notify(
            &retry_config,
            agent.name(),
            || async { agent.execute(opts.clone_opts()).await },
            |_attempt, _err, _delay| {
                retries_seen.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.metrics.record_retry();
            },
        )
        .await;
        let retry_count = retries_seen.load(std::sync::atomic::Ordering::Relaxed);

        match &result {
            Ok(r) => {
                trace.record(RecordEvent {
                    event_type: "response",
                    phase: "execute",
                    step: "execute_task",
                    agent: Some(agent.name()),
                    model: None,
                    task_id: Some(&task.id),
                    task_name: Some(&task.name),
                    tokens_in: r.tokens_in,
                    tokens_out: r.tokens_out,
                    content: &r.output,
                    ext: "txt",
                });
                self.metrics.record_task_finished(TaskMetric {
                    task_id: task.id.clone(),
                    agent: task.agent.clone(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    tokens_in: r.tokens_in,
                    tokens_out: r.tokens_out,
                    success: true,
                    error: None,
                });
                Ok((r.tokens_in, r.tokens_out, retry_count))
            }
            Err(e) => {
                trace.record(RecordEvent {
                    event_type: "error",
                    phase: "execute",
                    step: "execute_task",
                    agent: Some(agent.name()),
                    model: None,
                    task_id: Some(&task.id),
                    task_name: Some(&task.name),
                    tokens_in: 0,
                    tokens_out: 0,
                    content: &e.to_string(),
                    ext: "txt",
                });
                self.metrics.record_task_finished(TaskMetric {
                    task_id: task.id.clone(),
                    agent: task.agent.clone(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    tokens_in: 0,
                    tokens_out: 0,
                    success: false,
                    error: Some(e.to_string()),
                });
                Err(result.unwrap_err())
            }
        }
    }
}

fn render_combined_outputs(outputs: &[AnalysisOutput]) -> String {
    outputs
        .iter()
        .map(|o| format!("## Analysis from {}\n\n{}", o.agent, o.raw_output))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn parse_analysis_output(agent: &str, raw: &str) -> AnalysisOutput {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => {
            let claims = string_array(&value, "claims");
            let risks = string_array(&value, "risks");
            let recommendations = string_array(&value, "recommendations");
            AnalysisOutput::new(agent, raw, claims, risks, recommendations)
        }
        Err(_) => AnalysisOutput::unparsed(agent, raw),
    }
}

fn string_array(value: &serde_json::Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(serde_json::Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(serde_json::Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl OrchestratorConfig {
    fn clone_config(&self) -> Self {
        self.clone()
    }
}

impl AgentOptions {
    fn clone_opts(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support::ScriptedAgent;
    use crate::agent::{AgentResult, StaticAgentRegistry};
    use crate::state_manager::InMemoryStateManager;

    fn analysis_json(claims: &[&str], risks: &[&str], recs: &[&str]) -> String {
        serde_json::json!({"claims": claims, "risks": risks, "recommendations": recs}).to_string()
    }

    fn plan_json() -> String {
        serde_json::json!([
            {"id": "t1", "name": "step one", "agent": "claude", "depends_on": []},
        ])
        .to_string()
    }

    fn test_config(dir: &std::path::Path) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.trace_dir = dir.to_string_lossy().to_string();
        config
    }

    #[tokio::test]
    async fn run_rejects_empty_prompt() {
        let registry = Arc::new(StaticAgentRegistry::new().with_agent(ScriptedAgent::new("claude", vec![])));
        let state_manager = Arc::new(InMemoryStateManager::new());
        let runner = WorkflowRunner::new(registry, state_manager, OrchestratorConfig::default()).unwrap();

        let err = runner.run("").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn run_rejects_when_no_agents_available() {
        let registry = Arc::new(StaticAgentRegistry::new());
        let state_manager = Arc::new(InMemoryStateManager::new());
        let runner = WorkflowRunner::new(registry, state_manager, OrchestratorConfig::default()).unwrap();

        let err = runner.run("do something").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn full_workflow_completes_with_single_agent() {
        let outputs = vec![
            Ok(AgentResult::new(analysis_json(&["a"], &["r"], &["x"]))), // v1
            Ok(AgentResult::new("consolidated analysis content")),       // consolidate
            Ok(AgentResult::new(plan_json())),                            // plan
            Ok(AgentResult::new("done")),                                 // execute t1
        ];
        let agent = ScriptedAgent::new("claude", outputs);
        let registry = Arc::new(
            StaticAgentRegistry::new()
                .with_agent(agent.clone())
                .with_agent(ScriptedAgent::new("gemini", vec![])),
        );
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.default_agent = "claude".to_string();
        config.consolidator_agent = "claude".to_string();
        config.synthesis_agent = "claude".to_string();

        let state_manager = Arc::new(InMemoryStateManager::new());
        let runner = WorkflowRunner::new(registry, state_manager, config).unwrap();

        let state = runner.run("build something").await.unwrap();
        assert_eq!(state.status, Status::Completed);
        assert_eq!(state.tasks.len(), 1);
        assert_eq!(state.tasks["t1"].status, TaskStatus::Completed);

        let jsonl = std::fs::read_to_string(dir.path().join(&state.id).join("trace.jsonl")).unwrap();
        assert!(jsonl.lines().count() >= 4, "expected a prompt/response pair per agent call");
    }

    #[tokio::test]
    async fn plan_phase_fails_without_prior_analysis_checkpoint() {
        let registry = Arc::new(StaticAgentRegistry::new().with_agent(ScriptedAgent::new("claude", vec![])));
        let state_manager = Arc::new(InMemoryStateManager::new());
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let runner = WorkflowRunner::new(registry, state_manager, config.clone()).unwrap();

        let mut state = WorkflowState::new("hi", config);
        let trace = runner.open_trace(&state);
        let err = runner.run_plan(&mut state, &trace).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::State(StateError::MissingAnalysis)));
    }

    #[tokio::test]
    async fn run_times_out_when_a_phase_never_resolves() {
        let registry = Arc::new(StaticAgentRegistry::new().with_agent(ScriptedAgent::new("claude", vec![])));
        let state_manager = Arc::new(InMemoryStateManager::new());
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.overall_timeout_secs = 0;
        // Starve the bucket so the very first `acquire` parks on a real
        // timer, giving the outer timeout a future it can actually race.
        config.rate_limit = RateLimitConfig {
            capacity: 0.0,
            refill_per_sec: 0.0001,
        };

        let runner = WorkflowRunner::new(registry, state_manager, config).unwrap();
        let err = runner.run("do something").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout(_)));
    }
}
