//! Task executor
//!
//! Builds the per-task agent and prompt, drives the LLM's event sequence
//! through the plugin pipeline, classifies the outcome, and returns it as
//! data - a task never throws across its boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::events::{EventBus, LoopEvent};
use crate::llm::{ErrorClass, LlmClient, LlmError, LlmEvent, LlmRequest, Message};
use crate::pipeline::{CostSnapshot, InvocationContext, PluginPipeline, RetryDelta, ValidationDelta, keys};
use crate::prd::Task;
use crate::router::{ModelRouter, RoutingDecision};
use crate::session::SessionStore;
use crate::signal::CancelToken;
use crate::util::{now_utc, truncate_chars};

mod parallel;
mod sequential;

pub use parallel::{ParallelExecutor, group_by_level};
pub use sequential::SequentialRunner;

/// Output captured from quality-gate commands is capped at this many chars
const OUTPUT_CAP: usize = 2000;

/// The outcome of executing one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionResult {
    pub task_id: String,
    pub success: bool,
    pub attempts: u32,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub file_changes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Post-success quality gate commands
#[derive(Debug, Clone)]
pub struct QualityGateConfig {
    pub commands: Vec<String>,
    pub fail_on_issues: bool,
    pub timeout_ms: u64,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            fail_on_issues: true,
            timeout_ms: 300_000,
        }
    }
}

/// Executes a single task end to end
pub struct TaskExecutor {
    llm: Arc<dyn LlmClient>,
    pipeline: Arc<PluginPipeline>,
    sessions: Arc<dyn SessionStore>,
    router: Arc<ModelRouter>,
    bus: Arc<EventBus>,
    project_root: std::path::PathBuf,
    max_attempts: u32,
    quality_gate: Option<QualityGateConfig>,
    dry_run: bool,
    auto_commit: bool,
}

/// What one attempt produced
struct AttemptOutcome {
    events: Vec<LlmEvent>,
    merged_state: HashMap<String, serde_json::Value>,
    tokens: u64,
    cost: f64,
    llm_error: Option<LlmError>,
}

/// Classification of one attempt
enum AttemptVerdict {
    Success,
    /// Retry on the same model with error context appended
    Retry(String),
    /// Escalate to the next model on the cascade
    Escalate(String),
    /// Terminal failure for this task
    Fail(String),
}

impl TaskExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        pipeline: Arc<PluginPipeline>,
        sessions: Arc<dyn SessionStore>,
        router: Arc<ModelRouter>,
        bus: Arc<EventBus>,
        project_root: impl Into<std::path::PathBuf>,
        max_attempts: u32,
        quality_gate: Option<QualityGateConfig>,
        dry_run: bool,
    ) -> Self {
        Self {
            llm,
            pipeline,
            sessions,
            router,
            bus,
            project_root: project_root.into(),
            max_attempts: max_attempts.max(1),
            quality_gate,
            dry_run,
            auto_commit: false,
        }
    }

    /// Commit the working tree after each successful task
    pub fn with_auto_commit(mut self, enabled: bool) -> Self {
        self.auto_commit = enabled;
        self
    }

    /// Execute one task to a terminal outcome
    pub async fn execute(&self, task: &Task, decision: &RoutingDecision, cancel: &CancelToken) -> TaskExecutionResult {
        let started = std::time::Instant::now();

        self.bus.emit(LoopEvent::TaskStarted {
            timestamp: now_utc(),
            task_id: task.id.clone(),
            title: task.title.clone(),
            model: decision.selected_model.clone(),
        });

        let (result, ctx) = match self.run_task(task, decision, cancel, started).await {
            Ok(pair) => pair,
            Err(e) => {
                // Executor exceptions become failure data, never panics
                warn!(task_id = %task.id, error = %e, "Task executor error");
                (
                    TaskExecutionResult {
                        task_id: task.id.clone(),
                        success: false,
                        attempts: 1,
                        tokens_used: 0,
                        cost_usd: 0.0,
                        duration_ms: started.elapsed().as_millis() as u64,
                        file_changes: vec![],
                        error: Some(e.to_string()),
                    },
                    None,
                )
            }
        };

        if let Some(mut ctx) = ctx {
            self.pipeline.run_after_run(&mut ctx).await;
        }

        if result.success {
            info!(task_id = %task.id, attempts = result.attempts, "Task completed");
            self.bus.emit(LoopEvent::TaskCompleted {
                timestamp: now_utc(),
                task_id: task.id.clone(),
                attempts: result.attempts,
                cost_usd: result.cost_usd,
                duration_ms: result.duration_ms,
            });
        } else {
            warn!(task_id = %task.id, error = ?result.error, "Task failed");
            self.bus.emit(LoopEvent::TaskFailed {
                timestamp: now_utc(),
                task_id: task.id.clone(),
                error: result.error.clone().unwrap_or_default(),
                attempts: result.attempts,
            });
        }

        result
    }

    async fn run_task(
        &self,
        task: &Task,
        decision: &RoutingDecision,
        cancel: &CancelToken,
        started: std::time::Instant,
    ) -> eyre::Result<(TaskExecutionResult, Option<InvocationContext>)> {
        if self.dry_run {
            debug!(task_id = %task.id, model = %decision.selected_model, "Dry run, substituting success");
            return Ok((
                TaskExecutionResult {
                    task_id: task.id.clone(),
                    success: true,
                    attempts: 1,
                    tokens_used: 0,
                    cost_usd: 0.0,
                    duration_ms: started.elapsed().as_millis() as u64,
                    file_changes: vec![],
                    error: None,
                },
                None,
            ));
        }

        let agent_name = task.agent_name();
        let system_instruction = build_system_prompt(task);

        let session_id = self
            .sessions
            .create_session(
                &agent_name,
                "orchestrator",
                HashMap::from([
                    ("taskId".to_string(), serde_json::Value::String(task.id.clone())),
                    ("attempt".to_string(), serde_json::Value::from(1)),
                ]),
            )
            .await?;

        let mut ctx = InvocationContext::new(agent_name.clone(), task.id.clone(), session_id.clone());
        let mut conversation = vec![Message::user(build_task_prompt(task))];
        let mut current = decision.clone();

        let mut attempts = 0;
        let mut total_tokens = 0u64;
        let mut total_cost = 0.0f64;
        let mut failure: Option<String> = None;

        while attempts < self.max_attempts {
            attempts += 1;
            ctx.attempt = attempts;

            if cancel.is_cancelled() {
                failure = Some("Cancelled".to_string());
                break;
            }

            self.bus.emit(LoopEvent::AttemptStarted {
                timestamp: now_utc(),
                task_id: task.id.clone(),
                attempt: attempts,
                max_attempts: self.max_attempts,
            });
            self.sessions
                .put_state(
                    &session_id,
                    HashMap::from([("attempt".to_string(), serde_json::Value::from(attempts))]),
                )
                .await?;

            let mut request = LlmRequest::new(
                current.selected_model.clone(),
                system_instruction.clone(),
                conversation.clone(),
            );
            request.timeout = task.complexity.request_timeout();

            let outcome = self.run_attempt(&mut ctx, &mut request, cancel).await?;
            total_tokens += outcome.tokens;
            total_cost += outcome.cost;

            if let Some(delta) = outcome.merged_state.get(keys::VALIDATION)
                && let Ok(validation) = serde_json::from_value::<ValidationDelta>(delta.clone())
            {
                self.bus.emit(LoopEvent::ValidationCompleted {
                    timestamp: now_utc(),
                    task_id: task.id.clone(),
                    passed: validation.passed,
                    failed_steps: validation.failed_steps.clone(),
                    duration_ms: validation.total_duration_ms,
                });
            }

            match self.classify(&outcome, &current) {
                AttemptVerdict::Success => {
                    failure = None;
                    break;
                }
                AttemptVerdict::Retry(reason) => {
                    debug!(task_id = %task.id, attempt = attempts, %reason, "Retrying task");
                    failure = Some(reason.clone());
                    conversation.push(Message::user(format!(
                        "The previous attempt failed:\n{}\n\nFix the problem and try again.",
                        truncate_chars(&reason, OUTPUT_CAP)
                    )));
                }
                AttemptVerdict::Escalate(reason) => {
                    failure = Some(reason.clone());
                    match self.router.next_escalation(&current) {
                        Some(next) => {
                            info!(
                                task_id = %task.id,
                                from = %current.selected_model,
                                to = %next.selected_model,
                                %reason,
                                "Escalating on cascade"
                            );
                            current = next;
                            conversation.push(Message::user(format!(
                                "The previous attempt failed:\n{}\n\nFix the problem and try again.",
                                truncate_chars(&reason, OUTPUT_CAP)
                            )));
                        }
                        None => {
                            debug!(task_id = %task.id, "Cascade exhausted");
                            break;
                        }
                    }
                }
                AttemptVerdict::Fail(reason) => {
                    failure = Some(reason);
                    break;
                }
            }
        }

        // Post-success quality gate
        if failure.is_none()
            && let Some(gate) = &self.quality_gate
            && let Some(summary) = self.run_quality_gate(gate, cancel).await
        {
            if gate.fail_on_issues {
                failure = Some(summary);
            } else {
                warn!(task_id = %task.id, %summary, "Quality gate issues (not failing task)");
            }
        }

        if failure.is_none() && self.auto_commit {
            self.commit_changes(task).await;
        }

        // History learns the model that actually ran last, post-escalation
        self.router
            .record_outcome(task, &current.selected_model, failure.is_none(), total_cost);

        Ok((
            TaskExecutionResult {
                task_id: task.id.clone(),
                success: failure.is_none(),
                attempts,
                tokens_used: total_tokens,
                cost_usd: total_cost,
                duration_ms: started.elapsed().as_millis() as u64,
                file_changes: task.files_affected.clone(),
                error: failure,
            },
            Some(ctx),
        ))
    }

    /// Run one model invocation through the pipeline and drain its events
    async fn run_attempt(
        &self,
        ctx: &mut InvocationContext,
        request: &mut LlmRequest,
        cancel: &CancelToken,
    ) -> eyre::Result<AttemptOutcome> {
        let mut outcome = AttemptOutcome {
            events: Vec::new(),
            merged_state: HashMap::new(),
            tokens: 0,
            cost: 0.0,
            llm_error: None,
        };

        ctx.state_delta.clear();

        // before_model may short-circuit with a synthetic response
        if let Some(mut synthetic) = self.pipeline.run_before_model(ctx, request).await {
            self.pipeline.run_after_model(ctx, &mut synthetic).await;
            self.absorb_event(ctx, synthetic, &mut outcome).await?;
            return Ok(outcome);
        }

        let stream = match self.llm.generate(request.clone()).await {
            Ok(stream) => stream,
            Err(error) => {
                // A plugin may substitute a response for the error
                if let Some(mut substitute) = self.pipeline.run_on_model_error(ctx, request, &error).await {
                    self.pipeline.run_after_model(ctx, &mut substitute).await;
                    self.absorb_event(ctx, substitute, &mut outcome).await?;
                } else {
                    outcome.llm_error = Some(error);
                }
                return Ok(outcome);
            }
        };

        let mut stream = stream;
        while let Some(mut event) = stream.next().await {
            self.pipeline.run_after_model(ctx, &mut event).await;
            self.absorb_event(ctx, event, &mut outcome).await?;

            // In-flight workers finish the current event cycle, then exit
            if cancel.is_cancelled() {
                break;
            }
        }

        Ok(outcome)
    }

    /// Flush the context delta into the session and record the event
    async fn absorb_event(
        &self,
        ctx: &mut InvocationContext,
        event: LlmEvent,
        outcome: &mut AttemptOutcome,
    ) -> eyre::Result<()> {
        let delta = ctx.take_delta();
        if !delta.is_empty() {
            outcome.merged_state.extend(delta.clone());
            self.sessions.put_state(&ctx.session_id, delta).await?;
        }

        if let Some(usage) = &event.usage
            && !event.partial
        {
            outcome.tokens += usage.total_token_count;
        }
        if let Some(cost) = outcome.merged_state.get(keys::COST)
            && let Some(current) = cost.get("current").and_then(|v| v.as_f64())
        {
            // __cost.current reflects the latest priced event
            outcome.cost += current;
            outcome.merged_state.remove(keys::COST);
        }

        self.sessions.append_events(&ctx.session_id, &[event.clone()]).await?;
        outcome.events.push(event);
        Ok(())
    }

    /// Classify an attempt per the four success clauses
    fn classify(&self, outcome: &AttemptOutcome, decision: &RoutingDecision) -> AttemptVerdict {
        if let Some(error) = &outcome.llm_error {
            return match error.classify() {
                ErrorClass::Transient => AttemptVerdict::Retry(error.to_string()),
                ErrorClass::Capability if decision.can_escalate => AttemptVerdict::Escalate(error.to_string()),
                _ => AttemptVerdict::Fail(error.to_string()),
            };
        }

        // Zero events means the backend hung or was killed
        let Some(last) = outcome.events.last() else {
            return AttemptVerdict::Fail("No model response received".to_string());
        };

        let retry_requested = outcome
            .merged_state
            .get(keys::RETRY)
            .and_then(|v| serde_json::from_value::<RetryDelta>(v.clone()).ok())
            .map(|r| r.retry)
            .unwrap_or(false);

        if let Some(code) = &last.error_code {
            let message = last.error_message.clone().unwrap_or_else(|| code.clone());
            if matches!(code.as_str(), "CONTEXT_LIMIT" | "TIMEOUT") && decision.can_escalate {
                return AttemptVerdict::Escalate(message);
            }
            if retry_requested {
                return AttemptVerdict::Retry(message);
            }
            return AttemptVerdict::Fail(message);
        }

        let validation_failed = outcome
            .merged_state
            .get(keys::VALIDATION)
            .and_then(|v| serde_json::from_value::<ValidationDelta>(v.clone()).ok())
            .map(|v| !v.passed)
            .unwrap_or(false);

        if validation_failed {
            let detail = last
                .custom_metadata
                .get("validationErrors")
                .and_then(|v| v.as_str())
                .map(|errors| format!("Validation failed\n{}", errors))
                .unwrap_or_else(|| "Validation failed".to_string());
            if retry_requested {
                return AttemptVerdict::Retry(detail);
            }
            return AttemptVerdict::Fail("Validation failed".to_string());
        }

        if !last.has_content() {
            return AttemptVerdict::Fail("Empty response from model".to_string());
        }

        AttemptVerdict::Success
    }

    /// Commit the working tree; failures are logged, never fatal
    async fn commit_changes(&self, task: &Task) {
        let message = format!("taskloop: {}", task.id);
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(format!("git add -A && git commit -m '{}'", message))
            .current_dir(&self.project_root)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                debug!(task_id = %task.id, "Auto-committed changes");
            }
            Ok(output) => {
                // Nothing staged is the common case and not a problem
                debug!(
                    task_id = %task.id,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "Auto-commit made no commit"
                );
            }
            Err(e) => warn!(task_id = %task.id, error = %e, "Auto-commit could not run"),
        }
    }

    /// Emit a cost_update event from the shared cost totals
    pub fn emit_cost_update(&self, snapshot: CostSnapshot) {
        self.bus.emit(LoopEvent::CostUpdate {
            timestamp: now_utc(),
            total_tokens: snapshot.total_tokens,
            total_cost_usd: snapshot.total_cost_usd,
        });
    }

    /// Run quality-gate commands; Some(summary) means issues were found
    async fn run_quality_gate(&self, gate: &QualityGateConfig, cancel: &CancelToken) -> Option<String> {
        let timeout = Duration::from_millis(gate.timeout_ms);

        for command in &gate.commands {
            if cancel.is_cancelled() {
                return None;
            }

            debug!(%command, "Quality gate: running");
            let output = tokio::time::timeout(
                timeout,
                tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .current_dir(&self.project_root)
                    .output(),
            )
            .await;

            match output {
                Ok(Ok(output)) if output.status.success() => {}
                Ok(Ok(output)) => {
                    let captured = if output.stdout.is_empty() {
                        String::from_utf8_lossy(&output.stderr).to_string()
                    } else {
                        String::from_utf8_lossy(&output.stdout).to_string()
                    };
                    return Some(format!(
                        "Quality gate '{}' failed:\n{}",
                        command,
                        truncate_chars(&captured, OUTPUT_CAP)
                    ));
                }
                Ok(Err(e)) => return Some(format!("Quality gate '{}' could not run: {}", command, e)),
                Err(_) => return Some(format!("Quality gate '{}' timed out after {:?}", command, timeout)),
            }
        }
        None
    }
}

/// Build the agent's system instruction from the task
pub fn build_system_prompt(task: &Task) -> String {
    let mut prompt = format!(
        "You are an autonomous software engineer working on the task below.\n\n\
         # {}\n\n{}\n",
        task.title, task.description
    );

    if let Some(story) = &task.user_story {
        prompt.push_str(&format!("\n## User story\n{}\n", story));
    }

    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\n## Acceptance criteria\n");
        for criterion in &task.acceptance_criteria {
            prompt.push_str(&format!("- {}\n", criterion.description()));
        }
    }

    if !task.files_affected.is_empty() {
        prompt.push_str("\n## Files affected\n");
        for file in &task.files_affected {
            prompt.push_str(&format!("- {}\n", file));
        }
    }

    prompt
}

/// Build the initial user message for the task
pub fn build_task_prompt(task: &Task) -> String {
    format!(
        "Implement the task '{}'. Make the necessary changes and report what you did.",
        task.title
    )
}
