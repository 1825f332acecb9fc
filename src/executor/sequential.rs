//! Sequential runner
//!
//! Strict dependency-ordered single-worker fallback: repeatedly pick the
//! first task whose dependencies are satisfied, run it, stop on failure
//! unless `continue_on_failure`.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::prd::Task;
use crate::router::{ModelPreference, ModelRouter};
use crate::signal::CancelToken;
use crate::state::{CheckpointManager, OrchestratorState};

use super::{TaskExecutionResult, TaskExecutor};

/// Runs tasks one at a time in dependency order
pub struct SequentialRunner {
    task_executor: Arc<TaskExecutor>,
    router: Arc<ModelRouter>,
    cost: Option<Arc<crate::pipeline::CostPlugin>>,
    continue_on_failure: bool,
}

impl SequentialRunner {
    pub fn new(
        task_executor: Arc<TaskExecutor>,
        router: Arc<ModelRouter>,
        cost: Option<Arc<crate::pipeline::CostPlugin>>,
        continue_on_failure: bool,
    ) -> Self {
        Self {
            task_executor,
            router,
            cost,
            continue_on_failure,
        }
    }

    /// Run all tasks to a terminal state
    pub async fn run(
        &self,
        tasks: &[Task],
        preference: &ModelPreference,
        state: &mut OrchestratorState,
        checkpoints: Option<&CheckpointManager>,
        cancel: &CancelToken,
    ) -> Vec<TaskExecutionResult> {
        let known: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        let mut all_results = Vec::new();
        let mut stopped = false;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // First task not yet terminal whose known deps are completed
            let next = tasks.iter().find(|t| {
                !state.is_done(&t.id)
                    && t.dependencies
                        .iter()
                        .all(|dep| !known.contains(dep.as_str()) || state.is_completed(dep))
            });

            let Some(task) = next else {
                break;
            };

            if stopped {
                state.record_skipped(task.id.clone());
                continue;
            }

            // A runnable task whose deps terminally failed or were skipped
            // cannot exist here; unmet-dep tasks simply never become `next`
            // until we fall through below.
            debug!(task_id = %task.id, "Sequential: running");
            let decision = self.router.route(task, preference);
            let result = self.task_executor.execute(task, &decision, cancel).await;

            let failed = !result.success;
            state.record_result(&result);
            all_results.push(result);

            if let Some(manager) = checkpoints
                && let Err(e) = manager.save(state, &all_results)
            {
                warn!(error = %e, "Checkpoint write failed");
            }

            if let Some(cost) = &self.cost {
                let snapshot = cost.snapshot();
                self.task_executor.emit_cost_update(snapshot);
                state.total_tokens_used = snapshot.total_tokens;
                state.total_cost_usd = snapshot.total_cost_usd;

                if let Some(reason) = cost.budget_exceeded() {
                    warn!(%reason, "Budget exhausted, stopping run");
                    break;
                }
            }

            if failed && !self.continue_on_failure {
                info!(task_id = %task.id, "Stopping after failure");
                stopped = true;
            }
        }

        // Whatever never became runnable had a failed or skipped dependency
        for task in tasks {
            if !state.is_done(&task.id) {
                info!(task_id = %task.id, "Dependencies unmet, skipping");
                state.record_skipped(task.id.clone());
            }
        }

        all_results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::create_event_bus;
    use crate::llm::LlmEvent;
    use crate::llm::client::mock::MockLlmClient;
    use crate::pipeline::PluginPipeline;
    use crate::session::InMemorySessionStore;
    use crate::signal::Cancellation;

    fn task_with_deps(id: &str, deps: &[&str]) -> Task {
        let mut task = Task::new(id, format!("Task {}", id), "desc");
        task.dependencies = deps.iter().map(|s| s.to_string()).collect();
        task
    }

    fn make_runner(llm: Arc<MockLlmClient>, continue_on_failure: bool) -> SequentialRunner {
        let executor = Arc::new(TaskExecutor::new(
            llm,
            Arc::new(PluginPipeline::new(vec![])),
            Arc::new(InMemorySessionStore::new()),
            Arc::new(ModelRouter::default()),
            create_event_bus(),
            ".",
            1,
            None,
            false,
        ));
        SequentialRunner::new(executor, Arc::new(ModelRouter::default()), None, continue_on_failure)
    }

    #[tokio::test]
    async fn test_runs_in_dependency_order() {
        let runner = make_runner(Arc::new(MockLlmClient::always_text("done")), true);

        // Declared out of order; dependencies force a, b, c
        let tasks = vec![
            task_with_deps("c", &["b"]),
            task_with_deps("a", &[]),
            task_with_deps("b", &["a"]),
        ];

        let mut state = OrchestratorState::new("run-1");
        let cancel = Cancellation::new().token();
        runner
            .run(&tasks, &ModelPreference::default(), &mut state, None, &cancel)
            .await;

        assert_eq!(state.completed_tasks, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_stop_on_first_failure() {
        let runner = make_runner(Arc::new(MockLlmClient::always_error(400)), false);

        let tasks = vec![
            task_with_deps("a", &[]),
            task_with_deps("b", &[]),
            task_with_deps("c", &[]),
        ];

        let mut state = OrchestratorState::new("run-1");
        let cancel = Cancellation::new().token();
        let results = runner
            .run(&tasks, &ModelPreference::default(), &mut state, None, &cancel)
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(state.failed_tasks, vec!["a"]);
        assert_eq!(state.skipped_tasks, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependent() {
        // "a" fails, "b" depends on it; with continue_on_failure "c" runs
        let llm = Arc::new(MockLlmClient::new(vec![
            Err(crate::llm::LlmError::InvalidResponse("broken".to_string())),
            Ok(vec![LlmEvent::text("model", "done")]),
        ]));
        let runner = make_runner(llm, true);

        let tasks = vec![
            task_with_deps("a", &[]),
            task_with_deps("b", &["a"]),
            task_with_deps("c", &[]),
        ];

        let mut state = OrchestratorState::new("run-1");
        let cancel = Cancellation::new().token();
        runner
            .run(&tasks, &ModelPreference::default(), &mut state, None, &cancel)
            .await;

        assert_eq!(state.failed_tasks, vec!["a"]);
        assert_eq!(state.completed_tasks, vec!["c"]);
        assert_eq!(state.skipped_tasks, vec!["b"]);
    }

    #[tokio::test]
    async fn test_empty_task_list() {
        let runner = make_runner(Arc::new(MockLlmClient::always_text("unused")), true);

        let mut state = OrchestratorState::new("run-1");
        let cancel = Cancellation::new().token();
        let results = runner
            .run(&[], &ModelPreference::default(), &mut state, None, &cancel)
            .await;

        assert!(results.is_empty());
        assert!(state.completed_tasks.is_empty());
    }
}
