//! Orchestrator facade
//!
//! Loads and validates the PRD, wires the plugin pipeline, drives either
//! the sequential or the parallel executor, and finishes with a terminal
//! typecheck fix pass. Owns the run state, the checkpoint manager, and the
//! plugin instances for the whole run.

use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, eyre};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::events::{EventBus, LoopEvent, create_event_bus, spawn_event_logger};
use crate::executor::{ParallelExecutor, SequentialRunner, TaskExecutionResult, TaskExecutor};
use crate::llm::{EventStream, LlmClient, LlmError, LlmRequest};
use crate::pipeline::{
    CircuitBreakerPlugin, ContextConfig, ContextPlugin, ContextSource, CostConfig, CostPlugin, Plugin, PluginPipeline,
    RateLimitPlugin, RetryConfig, RetryPlugin, StaticContextSource, ValidationConfig, ValidationPlugin,
};
use crate::prd::Prd;
use crate::router::{FallbackRouter, HttpHealthMonitor, ModelPreference, ModelRouter, ProviderEndpoint, RoutingHistory};
use crate::session::{FileSessionStore, InMemorySessionStore, SessionStore};
use crate::signal::{Cancellation, ChildRegistry, SignalHandler};
use crate::state::{CheckpointManager, OrchestratorState, RunStatus};
use crate::util::now_utc;

mod fix_pass;

pub use fix_pass::{FIX_TASK_ID, build_fix_task, extract_affected_files, run_typecheck};

/// Hard timeout on the final typecheck command
const TYPECHECK_TIMEOUT: Duration = Duration::from_secs(300);

/// Final run summary printed as the data output of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub total_tokens_used: u64,
    pub total_cost_usd: f64,
    pub duration_ms: u64,
}

/// Placeholder client for dry runs; the executor never calls it
#[derive(Debug)]
struct NullLlm;

#[async_trait::async_trait]
impl LlmClient for NullLlm {
    async fn generate(&self, _request: LlmRequest) -> Result<EventStream, LlmError> {
        Err(LlmError::ProviderUnavailable("dry run".to_string()))
    }

    fn provider(&self) -> &str {
        "null"
    }
}

/// Drives one PRD run end to end
pub struct Orchestrator {
    config: OrchestratorConfig,
    run_id: String,
    state: OrchestratorState,
    bus: Arc<EventBus>,
    cancellation: Arc<Cancellation>,
    children: Arc<ChildRegistry>,
    signal_handler: Option<Arc<SignalHandler>>,
    context_source: Option<Arc<dyn ContextSource>>,
    llm_override: Option<Arc<dyn LlmClient>>,
    started: bool,
}

impl Orchestrator {
    /// Create an orchestrator for a config
    pub fn new(config: OrchestratorConfig) -> eyre::Result<Self> {
        eyre::ensure!(
            !config.project_root.as_os_str().is_empty(),
            "project_root is required"
        );

        let run_id = config
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        Ok(Self {
            state: OrchestratorState::new(&run_id),
            config,
            run_id,
            bus: create_event_bus(),
            cancellation: Arc::new(Cancellation::new()),
            children: Arc::new(ChildRegistry::new()),
            signal_handler: None,
            context_source: None,
            llm_override: None,
            started: false,
        })
    }

    /// Supply the external context collaborator
    pub fn with_context_source(mut self, source: Arc<dyn ContextSource>) -> Self {
        self.context_source = Some(source);
        self
    }

    /// Bypass provider selection with a concrete client (embedding, tests)
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm_override = Some(llm);
        self
    }

    /// The run's event bus
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Register an event callback
    pub fn on_event(&self, handler: impl Fn(&LoopEvent) + Send + Sync + 'static) {
        self.bus.on(handler);
    }

    /// Register a callback fired on every cost update
    pub fn on_cost_update(&self, handler: impl Fn(u64, f64) + Send + Sync + 'static) {
        self.bus.on(move |event| {
            if let LoopEvent::CostUpdate {
                total_tokens,
                total_cost_usd,
                ..
            } = event
            {
                handler(*total_tokens, *total_cost_usd);
            }
        });
    }

    /// Register a callback fired when the circuit breaker trips
    pub fn on_circuit_breaker_trip(&self, handler: impl Fn(u32) + Send + Sync + 'static) {
        self.bus.on(move |event| {
            if let LoopEvent::CircuitBreakerTripped {
                consecutive_failures, ..
            } = event
            {
                handler(*consecutive_failures);
            }
        });
    }

    /// Current run state
    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    /// Request graceful cancellation
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.cancellation.cancel(reason.clone());
        self.bus.emit(LoopEvent::LoopCancelling {
            timestamp: now_utc(),
            run_id: self.run_id.clone(),
            reason,
        });
    }

    /// Run the PRD to completion
    ///
    /// Calling `run` twice without `reset` is a programmer error and
    /// panics.
    pub async fn run(&mut self) -> eyre::Result<RunSummary> {
        assert!(!self.started, "Orchestrator::run called twice without reset()");
        self.started = true;
        let started_instant = std::time::Instant::now();

        let prd_path = self
            .config
            .prd_path
            .clone()
            .ok_or_else(|| eyre!("prd_path is required to run"))?;
        let prd = Prd::load(&prd_path).with_context(|| format!("Failed to load PRD from {}", prd_path.display()))?;

        std::fs::create_dir_all(&self.config.state_dir).context("Failed to create state dir")?;

        // Resume from a checkpoint when one exists for this run id
        let checkpoints = if self.config.enable_checkpoints {
            Some(CheckpointManager::new(
                self.config.state_dir.join("checkpoints"),
                &self.run_id,
            )?)
        } else {
            None
        };

        let mut all_results: Vec<TaskExecutionResult> = Vec::new();
        if let Some(manager) = &checkpoints
            && let Some(checkpoint) = manager.load()
        {
            info!(
                completed = checkpoint.state.completed_tasks.len(),
                failed = checkpoint.state.failed_tasks.len(),
                "Resuming from checkpoint"
            );
            self.state = checkpoint.state;
            all_results = checkpoint.recent_results;
        }

        self.state.status = RunStatus::Running;
        self.state.started_at = Some(now_utc());

        let handler = Arc::new(SignalHandler::new(
            Arc::clone(&self.cancellation),
            Arc::clone(&self.children),
            Arc::clone(&self.bus),
            &self.run_id,
        ));
        Arc::clone(&handler).install();
        self.signal_handler = Some(handler);

        if self.config.verbose {
            spawn_event_logger(&self.bus);
        }

        self.bus.emit(LoopEvent::LoopStarted {
            timestamp: now_utc(),
            run_id: self.run_id.clone(),
            project: prd.project.clone(),
            total_tasks: prd.tasks.len(),
        });

        let default_model = self
            .config
            .model
            .clone()
            .unwrap_or_else(|| self.config.llm.model.clone());
        let preference = ModelPreference {
            model: self.config.model.clone(),
            min_tier: None,
            no_cascade: false,
        };

        let llm = self.init_llm(&default_model).await?;

        // Plugin order is fixed here for the whole run; resumed spend is
        // seeded so budget caps hold across restarts.
        let cost = Arc::new(
            CostPlugin::new(
                CostConfig {
                    max_cost_usd: self.config.max_cost_usd,
                    max_tokens: self.config.max_tokens,
                },
                &default_model,
            )
            .with_initial_totals(self.state.total_tokens_used, self.state.total_cost_usd),
        );
        let circuit = self.config.circuit_breaker.clone().map(|cfg| {
            let bus = Arc::clone(&self.bus);
            Arc::new(CircuitBreakerPlugin::new(cfg).with_trip_callback(move |failures| {
                bus.emit(LoopEvent::CircuitBreakerTripped {
                    timestamp: now_utc(),
                    consecutive_failures: failures,
                });
            }))
        });

        let mut plugins: Vec<Arc<dyn Plugin>> = Vec::new();
        if self.config.enable_context {
            let source = self
                .context_source
                .clone()
                .unwrap_or_else(|| Arc::new(StaticContextSource::default()));
            let context_config = ContextConfig {
                include_memories: self.config.enable_memory,
                ..ContextConfig::default()
            };
            plugins.push(Arc::new(ContextPlugin::new(source, context_config)));
        }
        if let Some(rate_limit) = self.config.rate_limit.clone() {
            plugins.push(Arc::new(RateLimitPlugin::new(rate_limit)));
        }
        plugins.push(cost.clone());
        if !self.config.validation_steps.is_empty() {
            plugins.push(Arc::new(ValidationPlugin::new(ValidationConfig {
                steps: self.config.validation_steps.clone(),
                fail_fast: self.config.fail_fast_validation,
                working_dir: self.config.project_root.clone(),
            })));
        }
        if let Some(circuit) = &circuit {
            plugins.push(circuit.clone());
        }
        plugins.push(Arc::new(RetryPlugin::new(RetryConfig {
            max_attempts: self.config.max_attempts,
            ..RetryConfig::default()
        })));
        let pipeline = Arc::new(PluginPipeline::new(plugins));

        // Persistent sessions in single-agent mode enable resume; the
        // parallel mode uses volatile per-task sessions.
        let sessions: Arc<dyn SessionStore> = if self.config.enable_parallel_execution {
            Arc::new(InMemorySessionStore::new())
        } else {
            Arc::new(FileSessionStore::open(self.config.state_dir.join("sessions"))?)
        };

        let history_path = self.config.state_dir.join("routing_history.json");
        let router = Arc::new(ModelRouter::new(RoutingHistory::load(&history_path)));

        // PRD-level autoCommit wins over the constructor flag
        let auto_commit = prd
            .config
            .as_ref()
            .and_then(|c| c.auto_commit)
            .unwrap_or(self.config.enable_git_auto_commit);

        let task_executor = Arc::new(
            TaskExecutor::new(
                llm,
                pipeline,
                Arc::clone(&sessions),
                Arc::clone(&router),
                Arc::clone(&self.bus),
                self.config.project_root.clone(),
                self.config.max_attempts,
                self.config.quality_gate.clone(),
                self.config.dry_run,
            )
            .with_auto_commit(auto_commit),
        );

        let cancel = self.cancellation.token();
        let results = if self.config.enable_parallel_execution {
            ParallelExecutor::new(
                Arc::clone(&task_executor),
                Arc::clone(&router),
                Some(cost.clone()),
                self.config.max_parallel_tasks,
                self.config.continue_on_failure,
            )
            .run(&prd.tasks, &preference, &mut self.state, checkpoints.as_ref(), &cancel)
            .await
        } else {
            SequentialRunner::new(
                Arc::clone(&task_executor),
                Arc::clone(&router),
                Some(cost.clone()),
                self.config.continue_on_failure,
            )
            .run(&prd.tasks, &preference, &mut self.state, checkpoints.as_ref(), &cancel)
            .await
        };
        all_results.extend(results);

        let snapshot = cost.snapshot();
        self.state.total_tokens_used = snapshot.total_tokens;
        self.state.total_cost_usd = snapshot.total_cost_usd;

        if self.cancellation.is_cancelled() {
            warn!("Run cancelled");
            self.state.status = RunStatus::Cancelled;
        } else if let Some(reason) = cost.budget_exceeded() {
            warn!(%reason, "Run failed on budget");
            self.state.status = RunStatus::Failed;
            self.bus.emit(LoopEvent::LoopFailed {
                timestamp: now_utc(),
                run_id: self.run_id.clone(),
                error: reason,
            });
        } else {
            // Terminal typecheck fix pass, never recursive
            if let Some(command) = self.config.typecheck_command.clone()
                && !self.config.dry_run
                && !self.state.is_done(FIX_TASK_ID)
                && let Some(output) = run_typecheck(&command, &self.config.project_root, TYPECHECK_TIMEOUT).await
            {
                let fix_task = build_fix_task(&output);
                let decision = router.route(&fix_task, &preference);
                let result = task_executor.execute(&fix_task, &decision, &cancel).await;
                self.state.record_result(&result);
                all_results.push(result);
                if let Some(manager) = &checkpoints
                    && let Err(e) = manager.save(&self.state, &all_results)
                {
                    warn!(error = %e, "Checkpoint write failed");
                }
            }

            if !self.config.continue_on_failure && !self.state.failed_tasks.is_empty() {
                let error = all_results
                    .iter()
                    .find(|r| !r.success)
                    .and_then(|r| r.error.clone())
                    .unwrap_or_else(|| "task failed".to_string());
                self.state.status = RunStatus::Failed;
                self.bus.emit(LoopEvent::LoopFailed {
                    timestamp: now_utc(),
                    run_id: self.run_id.clone(),
                    error,
                });
            } else {
                self.state.status = RunStatus::Completed;
                self.bus.emit(LoopEvent::LoopCompleted {
                    timestamp: now_utc(),
                    run_id: self.run_id.clone(),
                    completed: self.state.completed_tasks.len(),
                    failed: self.state.failed_tasks.len(),
                    skipped: self.state.skipped_tasks.len(),
                    total_cost_usd: self.state.total_cost_usd,
                });
                if let Some(manager) = &checkpoints
                    && self.state.failed_tasks.is_empty()
                    && let Err(e) = manager.clear()
                {
                    warn!(error = %e, "Failed to clear checkpoint");
                }
            }
        }

        self.state.completed_at = Some(now_utc());

        if let Err(e) = router.save_history(&history_path) {
            warn!(error = %e, "Failed to persist routing history");
        }
        if let Err(e) = sessions.close().await {
            warn!(error = %e, "Failed to close session store");
        }

        Ok(RunSummary {
            run_id: self.run_id.clone(),
            status: self.state.status,
            completed: self.state.completed_tasks.clone(),
            failed: self.state.failed_tasks.clone(),
            skipped: self.state.skipped_tasks.clone(),
            total_tokens_used: self.state.total_tokens_used,
            total_cost_usd: self.state.total_cost_usd,
            duration_ms: started_instant.elapsed().as_millis() as u64,
        })
    }

    /// Destroy run state and deregister signal hooks
    pub fn reset(&mut self) {
        if let Some(handler) = self.signal_handler.take() {
            handler.uninstall();
        }
        self.state = OrchestratorState::new(&self.run_id);
        self.started = false;
    }

    async fn init_llm(&self, model: &str) -> eyre::Result<Arc<dyn LlmClient>> {
        if let Some(llm) = &self.llm_override {
            return Ok(Arc::clone(llm));
        }
        if self.config.dry_run {
            return Ok(Arc::new(NullLlm));
        }

        let primary = ProviderEndpoint {
            provider: self.config.llm.provider.clone(),
            backend: self.config.backend,
            config: self.config.llm.clone(),
        };

        // Same provider on the alternate backend is the one fallback we can
        // derive without extra configuration.
        let alternate = {
            use crate::config::BackendKind;
            let backend = match self.config.backend {
                BackendKind::Cli => BackendKind::Api,
                BackendKind::Api | BackendKind::Proxy => BackendKind::Cli,
            };
            ProviderEndpoint {
                provider: format!("{}-{:?}", self.config.llm.provider, backend).to_lowercase(),
                backend,
                config: self.config.llm.clone(),
            }
        };

        let router = FallbackRouter::new(Arc::new(HttpHealthMonitor::default()), vec![alternate])
            .with_child_registry(Arc::clone(&self.children));

        router
            .llm_with_fallback(model, &primary)
            .await
            .map_err(|e| eyre!("LLM initialization failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmEvent;
    use crate::llm::client::mock::MockLlmClient;
    use crate::pipeline::CircuitBreakerConfig;
    use std::path::Path;

    fn write_prd(dir: &Path, tasks_json: &str) -> std::path::PathBuf {
        let path = dir.join("prd.json");
        let json = format!(r#"{{"project": "demo", "tasks": {}}}"#, tasks_json);
        std::fs::write(&path, json).unwrap();
        path
    }

    fn base_config(dir: &Path, prd: &Path) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::new(dir);
        config.prd_path = Some(prd.to_path_buf());
        config.state_dir = dir.join(".taskloop");
        config
    }

    const LINEAR_TASKS: &str = r#"[
        {"id": "a", "title": "A", "description": "first"},
        {"id": "b", "title": "B", "description": "second", "dependencies": ["a"]},
        {"id": "c", "title": "C", "description": "third", "dependencies": ["b"]}
    ]"#;

    #[tokio::test]
    async fn test_linear_prd_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let prd = write_prd(dir.path(), LINEAR_TASKS);
        let config = base_config(dir.path(), &prd);

        let mut orchestrator = Orchestrator::new(config)
            .unwrap()
            .with_llm(Arc::new(MockLlmClient::always_text("done")));
        let mut rx = orchestrator.bus().subscribe();

        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.completed, vec!["a", "b", "c"]);
        assert!(summary.total_cost_usd > 0.0);

        let mut types = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.event_type() != "attempt_started" && event.event_type() != "cost_update" {
                types.push(format!(
                    "{}{}",
                    event.event_type(),
                    event.task_id().map(|t| format!("({})", t)).unwrap_or_default()
                ));
            }
        }
        assert_eq!(
            types,
            vec![
                "loop_started",
                "task_started(a)",
                "task_completed(a)",
                "task_started(b)",
                "task_completed(b)",
                "task_started(c)",
                "task_completed(c)",
                "loop_completed",
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_task_list_completes_with_zero_totals() {
        let dir = tempfile::tempdir().unwrap();
        let prd = write_prd(dir.path(), "[]");
        let config = base_config(dir.path(), &prd);

        let mut orchestrator = Orchestrator::new(config)
            .unwrap()
            .with_llm(Arc::new(MockLlmClient::always_text("unused")));

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.total_tokens_used, 0);
        assert_eq!(summary.total_cost_usd, 0.0);
    }

    #[tokio::test]
    async fn test_budget_stop_fails_run_after_first_task() {
        let dir = tempfile::tempdir().unwrap();
        let prd = write_prd(dir.path(), LINEAR_TASKS);
        let mut config = base_config(dir.path(), &prd);
        config.max_cost_usd = Some(0.01);
        config.continue_on_failure = true;

        // ~$0.02 per task at sonnet pricing (5k input + 300 output tokens)
        let expensive = || Ok(vec![LlmEvent::text("mock", "done").with_usage(5000, 300)]);
        let llm = Arc::new(MockLlmClient::new(vec![expensive(), expensive(), expensive()]));
        let mut orchestrator = Orchestrator::new(config).unwrap().with_llm(llm);
        let mut rx = orchestrator.bus().subscribe();

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        // Task A crossed the cap but still completed
        assert_eq!(summary.completed, vec!["a"]);

        let mut saw_completed_a = false;
        let mut saw_loop_failed = false;
        while let Ok(event) = rx.try_recv() {
            match &event {
                LoopEvent::TaskCompleted { task_id, .. } if task_id == "a" => saw_completed_a = true,
                LoopEvent::LoopFailed { error, .. } => {
                    saw_loop_failed = true;
                    assert!(error.contains("BUDGET_EXCEEDED"), "error: {}", error);
                }
                LoopEvent::TaskStarted { task_id, .. } => {
                    assert_eq!(task_id, "a", "no task after the budget stop");
                }
                _ => {}
            }
        }
        assert!(saw_completed_a && saw_loop_failed);
    }

    #[tokio::test]
    async fn test_circuit_trips_and_tasks_fail_open() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = r#"[
            {"id": "a", "title": "A", "description": "x"},
            {"id": "b", "title": "B", "description": "x"},
            {"id": "c", "title": "C", "description": "x"},
            {"id": "d", "title": "D", "description": "x"}
        ]"#;
        let prd = write_prd(dir.path(), tasks);
        let mut config = base_config(dir.path(), &prd);
        config.continue_on_failure = true;
        config.max_attempts = 1;
        config.circuit_breaker = Some(CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout_ms: 60_000,
        });

        let llm = Arc::new(MockLlmClient::always_error(400));
        let mut orchestrator = Orchestrator::new(config).unwrap().with_llm(llm.clone());
        let mut rx = orchestrator.bus().subscribe();

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.failed.len(), 4);

        // After three failures the circuit opened; task d was rejected
        // without reaching the provider.
        assert_eq!(llm.call_count(), 3);

        let mut tripped = false;
        let mut d_error = String::new();
        while let Ok(event) = rx.try_recv() {
            match &event {
                LoopEvent::CircuitBreakerTripped { .. } => tripped = true,
                LoopEvent::TaskFailed { task_id, error, .. } if task_id == "d" => d_error = error.clone(),
                _ => {}
            }
        }
        assert!(tripped);
        assert!(d_error.contains("circuit breaker"), "error: {}", d_error);
    }

    #[tokio::test]
    async fn test_parallel_levels_with_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = r#"[
            {"id": "a", "title": "A", "description": "x"},
            {"id": "b", "title": "B", "description": "x"},
            {"id": "c", "title": "C", "description": "x"},
            {"id": "d", "title": "D", "description": "x", "dependencies": ["a", "b", "c"]}
        ]"#;
        let prd = write_prd(dir.path(), tasks);
        let mut config = base_config(dir.path(), &prd);
        config.enable_parallel_execution = true;
        config.max_parallel_tasks = 2;
        config.continue_on_failure = true;

        let mut orchestrator = Orchestrator::new(config)
            .unwrap()
            .with_llm(Arc::new(MockLlmClient::always_text("done")));

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.completed.len(), 4);
        assert_eq!(summary.completed.last().unwrap(), "d");
    }

    #[tokio::test]
    async fn test_checkpoint_resume_skips_done_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let prd = write_prd(dir.path(), LINEAR_TASKS);

        // Seed a checkpoint as if the process died after task a
        let mut config = base_config(dir.path(), &prd);
        config.enable_checkpoints = true;
        config.run_id = Some("resume-test".to_string());

        let manager = CheckpointManager::new(config.state_dir.join("checkpoints"), "resume-test").unwrap();
        let mut state = OrchestratorState::new("resume-test");
        state.completed_tasks.push("a".to_string());
        manager.save(&state, &[]).unwrap();

        let llm = Arc::new(MockLlmClient::always_text("done"));
        let mut orchestrator = Orchestrator::new(config).unwrap().with_llm(llm);
        let mut rx = orchestrator.bus().subscribe();

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        // a was restored, b and c actually ran
        assert_eq!(summary.completed, vec!["a", "b", "c"]);

        let mut first_task_started = None;
        while let Ok(event) = rx.try_recv() {
            if let LoopEvent::TaskStarted { task_id, .. } = &event
                && first_task_started.is_none()
            {
                first_task_started = Some(task_id.clone());
            }
        }
        assert_eq!(first_task_started.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_typecheck_fix_pass_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let prd = write_prd(dir.path(), r#"[{"id": "a", "title": "A", "description": "x"}]"#);
        let mut config = base_config(dir.path(), &prd);
        config.continue_on_failure = true;
        // Typecheck always fails; the fix task must still run exactly once
        config.typecheck_command = Some("echo 'src/x.ts(1,1): error TS1' && false".to_string());

        let llm = Arc::new(MockLlmClient::always_text("done"));
        let mut orchestrator = Orchestrator::new(config).unwrap().with_llm(llm.clone());

        let summary = orchestrator.run().await.unwrap();
        assert!(summary.completed.contains(&FIX_TASK_ID.to_string()));
        // One call for task a, one for the fix task, no recursion
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_status() {
        let dir = tempfile::tempdir().unwrap();
        let prd = write_prd(dir.path(), LINEAR_TASKS);
        let config = base_config(dir.path(), &prd);

        let mut orchestrator = Orchestrator::new(config)
            .unwrap()
            .with_llm(Arc::new(MockLlmClient::always_text("done")));
        orchestrator.cancel("test shutdown");

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_dry_run_touches_no_provider() {
        let dir = tempfile::tempdir().unwrap();
        let prd = write_prd(dir.path(), LINEAR_TASKS);
        let mut config = base_config(dir.path(), &prd);
        config.dry_run = true;

        let mut orchestrator = Orchestrator::new(config).unwrap();
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.completed.len(), 3);
        assert_eq!(summary.total_cost_usd, 0.0);
    }

    #[tokio::test]
    async fn test_invalid_prd_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prd.json");
        std::fs::write(
            &path,
            r#"{"project": "demo", "tasks": [
                {"id": "a", "title": "A", "description": "x", "dependencies": ["b"]},
                {"id": "b", "title": "B", "description": "x", "dependencies": ["a"]}
            ]}"#,
        )
        .unwrap();
        let config = base_config(dir.path(), &path);

        let mut orchestrator = Orchestrator::new(config)
            .unwrap()
            .with_llm(Arc::new(MockLlmClient::always_text("unused")));

        let err = orchestrator.run().await.unwrap_err();
        assert!(format!("{:#}", err).contains("cycle"));
    }

    #[tokio::test]
    #[should_panic(expected = "run called twice")]
    async fn test_run_twice_panics() {
        let dir = tempfile::tempdir().unwrap();
        let prd = write_prd(dir.path(), "[]");
        let config = base_config(dir.path(), &prd);

        let mut orchestrator = Orchestrator::new(config)
            .unwrap()
            .with_llm(Arc::new(MockLlmClient::always_text("unused")));

        orchestrator.run().await.unwrap();
        let _ = orchestrator.run().await;
    }

    #[tokio::test]
    async fn test_reset_allows_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let prd = write_prd(dir.path(), "[]");
        let config = base_config(dir.path(), &prd);

        let mut orchestrator = Orchestrator::new(config)
            .unwrap()
            .with_llm(Arc::new(MockLlmClient::always_text("unused")));

        orchestrator.run().await.unwrap();
        orchestrator.reset();
        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_stop_on_failure_skips_remaining_and_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let prd = write_prd(dir.path(), LINEAR_TASKS);
        let mut config = base_config(dir.path(), &prd);
        config.continue_on_failure = false;
        config.max_attempts = 1;

        let llm = Arc::new(MockLlmClient::new(vec![Err(crate::llm::LlmError::InvalidResponse(
            "broken".to_string(),
        ))]));
        let mut orchestrator = Orchestrator::new(config).unwrap().with_llm(llm);

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.failed, vec!["a"]);
        assert_eq!(summary.skipped, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_rule_routing_is_reproducible_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let prd = write_prd(dir.path(), LINEAR_TASKS);

        let run = |root: std::path::PathBuf, prd: std::path::PathBuf| async move {
            let mut config = OrchestratorConfig::new(&root);
            config.prd_path = Some(prd);
            config.state_dir = root.join(".taskloop");
            config.dry_run = true;
            let mut orchestrator = Orchestrator::new(config).unwrap();
            orchestrator.run().await.unwrap()
        };

        let first = run(dir.path().to_path_buf(), prd.clone()).await;
        let second = run(dir.path().to_path_buf(), prd.clone()).await;
        assert_eq!(first.completed, second.completed);
    }

    #[tokio::test]
    async fn test_events_emitted_when_llm_events_error() {
        // A task whose last event carries an error code fails with that
        // message verbatim.
        let dir = tempfile::tempdir().unwrap();
        let prd = write_prd(dir.path(), r#"[{"id": "a", "title": "A", "description": "x"}]"#);
        let mut config = base_config(dir.path(), &prd);
        config.continue_on_failure = true;
        config.max_attempts = 1;

        let llm = Arc::new(MockLlmClient::new(vec![Ok(vec![LlmEvent::error(
            "model",
            "PROVIDER_ERROR",
            "upstream 500",
        )])]));
        let mut orchestrator = Orchestrator::new(config).unwrap().with_llm(llm);
        let mut rx = orchestrator.bus().subscribe();

        let summary = orchestrator.run().await.unwrap();
        assert_eq!(summary.failed, vec!["a"]);

        let mut error = String::new();
        while let Ok(event) = rx.try_recv() {
            if let LoopEvent::TaskFailed { error: e, .. } = &event {
                error = e.clone();
            }
        }
        assert_eq!(error, "upstream 500");
    }
}
