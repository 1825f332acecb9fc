//! Parallel executor
//!
//! Groups tasks by dependency level and runs each level in chunks of
//! bounded concurrency. The caller's state is mutated only here, on the
//! coordinator, after each chunk completes; workers communicate solely
//! via returned results.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::pipeline::CostPlugin;
use crate::prd::Task;
use crate::router::{ModelPreference, ModelRouter};
use crate::signal::CancelToken;
use crate::state::{CheckpointManager, OrchestratorState};

use super::{TaskExecutionResult, TaskExecutor};

/// Group tasks into dependency levels (level-by-level topological)
///
/// Dependencies on ids not present in the list are external and count as
/// satisfied. Returns the levels and any tasks left unreachable (deadlock
/// in a PRD that slipped past validation).
pub fn group_by_level(tasks: &[Task]) -> (Vec<Vec<String>>, Vec<String>) {
    let known: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let mut completed: HashSet<String> = HashSet::new();
    let mut remaining: Vec<&Task> = tasks.iter().collect();
    let mut levels = Vec::new();

    while !remaining.is_empty() {
        let (level, rest): (Vec<&Task>, Vec<&Task>) = remaining.into_iter().partition(|t| {
            t.dependencies
                .iter()
                .all(|dep| !known.contains(dep.as_str()) || completed.contains(dep))
        });

        if level.is_empty() {
            remaining = rest;
            break;
        }

        completed.extend(level.iter().map(|t| t.id.clone()));
        levels.push(level.into_iter().map(|t| t.id.clone()).collect());
        remaining = rest;
    }

    let unreachable = remaining.into_iter().map(|t| t.id.clone()).collect();
    (levels, unreachable)
}

/// Runs dependency levels with bounded concurrency
pub struct ParallelExecutor {
    task_executor: Arc<TaskExecutor>,
    router: Arc<ModelRouter>,
    cost: Option<Arc<CostPlugin>>,
    max_parallel_tasks: usize,
    continue_on_failure: bool,
}

impl ParallelExecutor {
    pub fn new(
        task_executor: Arc<TaskExecutor>,
        router: Arc<ModelRouter>,
        cost: Option<Arc<CostPlugin>>,
        max_parallel_tasks: usize,
        continue_on_failure: bool,
    ) -> Self {
        Self {
            task_executor,
            router,
            cost,
            max_parallel_tasks: max_parallel_tasks.max(1),
            continue_on_failure,
        }
    }

    /// Run all tasks, mutating state on the coordinator after each chunk
    ///
    /// Returns every task result in completion order. `state` is the only
    /// shared mutable structure and is touched exclusively here.
    pub async fn run(
        &self,
        tasks: &[Task],
        preference: &ModelPreference,
        state: &mut OrchestratorState,
        checkpoints: Option<&CheckpointManager>,
        cancel: &CancelToken,
    ) -> Vec<TaskExecutionResult> {
        let (levels, unreachable) = group_by_level(tasks);
        if !unreachable.is_empty() {
            warn!(?unreachable, "Unreachable tasks in dependency graph, skipping");
            for id in unreachable {
                state.record_skipped(id);
            }
        }

        let known: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        let mut all_results = Vec::new();
        let mut aborted = false;

        for (level_index, level) in levels.iter().enumerate() {
            if aborted || cancel.is_cancelled() {
                self.skip_remaining(level, state);
                continue;
            }

            debug!(level = level_index, tasks = level.len(), "Starting level");

            // Filter with state: already-done tasks are skipped silently
            // (resume), tasks with failed or skipped deps are skipped loudly.
            let mut eligible: Vec<&Task> = Vec::new();
            for id in level {
                let Some(task) = tasks.iter().find(|t| &t.id == id) else {
                    continue;
                };
                if state.is_done(id) {
                    debug!(task_id = %id, "Already done, skipping");
                    continue;
                }
                let deps_met = task
                    .dependencies
                    .iter()
                    .all(|dep| !known.contains(dep.as_str()) || state.is_completed(dep));
                if deps_met {
                    eligible.push(task);
                } else {
                    info!(task_id = %id, "Dependencies unmet, skipping");
                    state.record_skipped(id.clone());
                }
            }

            for chunk in eligible.chunks(self.max_parallel_tasks) {
                if aborted || cancel.is_cancelled() {
                    for task in chunk {
                        state.record_skipped(task.id.clone());
                    }
                    continue;
                }

                let handles: Vec<_> = chunk
                    .iter()
                    .map(|task| {
                        let task = (*task).clone();
                        let executor = Arc::clone(&self.task_executor);
                        let decision = self.router.route(&task, preference);
                        let cancel = cancel.clone();
                        tokio::spawn(async move { executor.execute(&task, &decision, &cancel).await })
                    })
                    .collect();

                // Single result-processing step after each chunk
                for handle in join_all(handles).await {
                    let result = match handle {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(error = %e, "Worker task panicked");
                            continue;
                        }
                    };

                    state.record_result(&result);
                    all_results.push(result.clone());

                    if let Some(manager) = checkpoints
                        && let Err(e) = manager.save(state, &all_results)
                    {
                        warn!(error = %e, "Checkpoint write failed");
                    }

                    if !result.success && !self.continue_on_failure {
                        warn!(task_id = %result.task_id, "Aborting remaining work after failure");
                        aborted = true;
                    }
                }

                if let Some(cost) = &self.cost {
                    let snapshot = cost.snapshot();
                    self.task_executor.emit_cost_update(snapshot);
                    state.total_tokens_used = snapshot.total_tokens;
                    state.total_cost_usd = snapshot.total_cost_usd;

                    if let Some(reason) = cost.budget_exceeded() {
                        warn!(%reason, "Budget exhausted, aborting remaining work");
                        aborted = true;
                    }
                }
            }
        }

        all_results
    }

    fn skip_remaining(&self, level: &[String], state: &mut OrchestratorState) {
        for id in level {
            if !state.is_done(id) {
                state.record_skipped(id.clone());
            }
        }
    }
}
