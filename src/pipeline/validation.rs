//! Validation plugin
//!
//! Runs an ordered list of external shell checks (typecheck, lint, tests,
//! build) after each final model event and attaches the outcome to state.
//! Failures never rewrite the response into an error; retry and circuit
//! decisions belong to their plugins.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::llm::LlmEvent;
use crate::util::truncate_chars;

use super::{InvocationContext, Plugin, keys};

/// Output captured from a step is capped at this many chars
const OUTPUT_CAP: usize = 2000;

/// One external validation step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationStep {
    pub name: String,
    pub command: String,
    #[serde(default = "default_step_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_step_timeout_ms() -> u64 {
    120_000
}

impl ValidationStep {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout_ms: default_step_timeout_ms(),
        }
    }
}

/// Validation policy for a run
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub steps: Vec<ValidationStep>,
    pub fail_fast: bool,
    pub working_dir: PathBuf,
}

/// Published under `__validation` after the steps run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationDelta {
    pub passed: bool,
    pub failed_steps: Vec<String>,
    pub total_duration_ms: u64,
}

/// Result of one executed step
#[derive(Debug)]
struct StepResult {
    name: String,
    passed: bool,
    output: String,
    duration_ms: u64,
}

/// Run one step via the shell with its own timeout
async fn run_step(step: &ValidationStep, working_dir: &std::path::Path) -> StepResult {
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(step.timeout_ms);

    let outcome = tokio::time::timeout(
        timeout,
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&step.command)
            .current_dir(working_dir)
            .output(),
    )
    .await;

    let duration_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(output)) => {
            let passed = output.status.success();
            let captured = if output.stdout.is_empty() {
                String::from_utf8_lossy(&output.stderr).to_string()
            } else {
                String::from_utf8_lossy(&output.stdout).to_string()
            };
            StepResult {
                name: step.name.clone(),
                passed,
                output: truncate_chars(&captured, OUTPUT_CAP),
                duration_ms,
            }
        }
        Ok(Err(e)) => StepResult {
            name: step.name.clone(),
            passed: false,
            output: format!("failed to spawn: {}", e),
            duration_ms,
        },
        Err(_) => StepResult {
            name: step.name.clone(),
            passed: false,
            output: format!("timed out after {:?}", timeout),
            duration_ms,
        },
    }
}

/// Runs configured shell checks and publishes the outcome
pub struct ValidationPlugin {
    config: ValidationConfig,
}

impl ValidationPlugin {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Plugin for ValidationPlugin {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn after_model(&self, ctx: &mut InvocationContext, event: &mut LlmEvent) {
        // Only final, successful events with content are validated
        if event.partial || event.is_error() || !event.has_content() || self.config.steps.is_empty() {
            return;
        }

        let mut results = Vec::new();
        for step in &self.config.steps {
            debug!(task_id = %ctx.task_id, step = %step.name, "ValidationPlugin: running step");
            let result = run_step(step, &self.config.working_dir).await;
            let failed = !result.passed;
            results.push(result);

            if failed && self.config.fail_fast {
                break;
            }
        }

        let failed: Vec<&StepResult> = results.iter().filter(|r| !r.passed).collect();
        let passed = failed.is_empty();
        let total_duration_ms = results.iter().map(|r| r.duration_ms).sum();

        if !passed {
            warn!(
                task_id = %ctx.task_id,
                failed_steps = ?failed.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
                "Validation failed"
            );

            let errors = failed
                .iter()
                .map(|r| format!("[{}]\n{}", r.name, r.output))
                .collect::<Vec<_>>()
                .join("\n\n");
            event
                .custom_metadata
                .insert("validationErrors".to_string(), serde_json::Value::String(errors));
        }

        ctx.publish(
            keys::VALIDATION,
            &ValidationDelta {
                passed,
                failed_steps: failed.iter().map(|r| r.name.clone()).collect(),
                total_duration_ms,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(steps: Vec<ValidationStep>, fail_fast: bool, dir: &std::path::Path) -> ValidationConfig {
        ValidationConfig {
            steps,
            fail_fast,
            working_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_all_steps_pass() {
        let dir = tempdir().unwrap();
        let plugin = ValidationPlugin::new(config(
            vec![
                ValidationStep::new("typecheck", "true"),
                ValidationStep::new("lint", "true"),
            ],
            true,
            dir.path(),
        ));

        let mut ctx = InvocationContext::new("agent", "t1", "s1");
        let mut event = LlmEvent::text("model", "done");
        plugin.after_model(&mut ctx, &mut event).await;

        let delta: ValidationDelta = ctx.read(keys::VALIDATION).unwrap();
        assert!(delta.passed);
        assert!(delta.failed_steps.is_empty());
        assert!(!event.custom_metadata.contains_key("validationErrors"));
    }

    #[tokio::test]
    async fn test_fail_fast_stops_at_first_failure() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("ran-second");
        let plugin = ValidationPlugin::new(config(
            vec![
                ValidationStep::new("typecheck", "echo broken && false"),
                ValidationStep::new("lint", &format!("touch {}", marker.display())),
            ],
            true,
            dir.path(),
        ));

        let mut ctx = InvocationContext::new("agent", "t1", "s1");
        let mut event = LlmEvent::text("model", "done");
        plugin.after_model(&mut ctx, &mut event).await;

        let delta: ValidationDelta = ctx.read(keys::VALIDATION).unwrap();
        assert!(!delta.passed);
        assert_eq!(delta.failed_steps, vec!["typecheck"]);
        assert!(!marker.exists(), "second step must not run under fail_fast");
    }

    #[tokio::test]
    async fn test_without_fail_fast_all_steps_run() {
        let dir = tempdir().unwrap();
        let plugin = ValidationPlugin::new(config(
            vec![
                ValidationStep::new("typecheck", "false"),
                ValidationStep::new("lint", "true"),
                ValidationStep::new("build", "false"),
            ],
            false,
            dir.path(),
        ));

        let mut ctx = InvocationContext::new("agent", "t1", "s1");
        let mut event = LlmEvent::text("model", "done");
        plugin.after_model(&mut ctx, &mut event).await;

        let delta: ValidationDelta = ctx.read(keys::VALIDATION).unwrap();
        assert!(!delta.passed);
        assert_eq!(delta.failed_steps, vec!["typecheck", "build"]);
    }

    #[tokio::test]
    async fn test_failure_attaches_validation_errors() {
        let dir = tempdir().unwrap();
        let plugin = ValidationPlugin::new(config(
            vec![ValidationStep::new("typecheck", "echo 'type error in a.ts' && false")],
            true,
            dir.path(),
        ));

        let mut ctx = InvocationContext::new("agent", "t1", "s1");
        let mut event = LlmEvent::text("model", "done");
        plugin.after_model(&mut ctx, &mut event).await;

        // The event is not rewritten into an error
        assert!(!event.is_error());
        let errors = event.custom_metadata.get("validationErrors").unwrap().as_str().unwrap();
        assert!(errors.contains("type error in a.ts"));
    }

    #[tokio::test]
    async fn test_step_timeout_counts_as_failure() {
        let dir = tempdir().unwrap();
        let mut step = ValidationStep::new("slow", "sleep 10");
        step.timeout_ms = 100;
        let plugin = ValidationPlugin::new(config(vec![step], true, dir.path()));

        let mut ctx = InvocationContext::new("agent", "t1", "s1");
        let mut event = LlmEvent::text("model", "done");
        plugin.after_model(&mut ctx, &mut event).await;

        let delta: ValidationDelta = ctx.read(keys::VALIDATION).unwrap();
        assert!(!delta.passed);
        assert_eq!(delta.failed_steps, vec!["slow"]);
    }

    #[tokio::test]
    async fn test_error_events_skip_validation() {
        let dir = tempdir().unwrap();
        let plugin = ValidationPlugin::new(config(vec![ValidationStep::new("typecheck", "true")], true, dir.path()));

        let mut ctx = InvocationContext::new("agent", "t1", "s1");
        let mut event = LlmEvent::error("model", "TIMEOUT", "deadline");
        plugin.after_model(&mut ctx, &mut event).await;

        assert!(ctx.read::<ValidationDelta>(keys::VALIDATION).is_none());
    }
}
