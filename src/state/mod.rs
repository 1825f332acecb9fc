//! Orchestrator run state
//!
//! Created at start, mutated only on the orchestrator thread, destroyed on
//! reset. Serializable so checkpoints round-trip it exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executor::TaskExecutionResult;

mod checkpoint;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointManager};

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-run orchestrator state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub status: RunStatus,

    /// Run-scoped session id
    pub session_id: String,

    /// Append-only, in completion order
    pub completed_tasks: Vec<String>,
    pub failed_tasks: Vec<String>,
    pub skipped_tasks: Vec<String>,

    pub total_tokens_used: u64,
    pub total_cost_usd: f64,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl OrchestratorState {
    /// Fresh state for a run
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Idle,
            session_id: session_id.into(),
            completed_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            skipped_tasks: Vec::new(),
            total_tokens_used: 0,
            total_cost_usd: 0.0,
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether a task has already reached a terminal state this run
    pub fn is_done(&self, task_id: &str) -> bool {
        self.completed_tasks.iter().any(|t| t == task_id)
            || self.failed_tasks.iter().any(|t| t == task_id)
            || self.skipped_tasks.iter().any(|t| t == task_id)
    }

    /// Whether a dependency counts as satisfied
    pub fn is_completed(&self, task_id: &str) -> bool {
        self.completed_tasks.iter().any(|t| t == task_id)
    }

    /// Fold one task result into the state
    pub fn record_result(&mut self, result: &TaskExecutionResult) {
        if result.success {
            self.completed_tasks.push(result.task_id.clone());
        } else {
            self.failed_tasks.push(result.task_id.clone());
        }
        self.total_tokens_used += result.tokens_used;
        self.total_cost_usd += result.cost_usd;
    }

    /// Mark a task skipped
    pub fn record_skipped(&mut self, task_id: impl Into<String>) {
        self.skipped_tasks.push(task_id.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(task_id: &str, success: bool) -> TaskExecutionResult {
        TaskExecutionResult {
            task_id: task_id.to_string(),
            success,
            attempts: 1,
            tokens_used: 100,
            cost_usd: 0.01,
            duration_ms: 10,
            file_changes: vec![],
            error: if success { None } else { Some("boom".to_string()) },
        }
    }

    #[test]
    fn test_record_result_updates_totals() {
        let mut state = OrchestratorState::new("run-1");

        state.record_result(&result("a", true));
        state.record_result(&result("b", false));

        assert_eq!(state.completed_tasks, vec!["a"]);
        assert_eq!(state.failed_tasks, vec!["b"]);
        assert_eq!(state.total_tokens_used, 200);
        assert!((state.total_cost_usd - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_is_done_covers_all_terminal_lists() {
        let mut state = OrchestratorState::new("run-1");
        state.record_result(&result("a", true));
        state.record_result(&result("b", false));
        state.record_skipped("c");

        assert!(state.is_done("a"));
        assert!(state.is_done("b"));
        assert!(state.is_done("c"));
        assert!(!state.is_done("d"));

        assert!(state.is_completed("a"));
        assert!(!state.is_completed("b"));
    }

    #[test]
    fn test_state_serde_round_trip() {
        let mut state = OrchestratorState::new("run-1");
        state.status = RunStatus::Running;
        state.started_at = Some(Utc::now());
        state.record_result(&result("a", true));

        let json = serde_json::to_string(&state).unwrap();
        let back: OrchestratorState = serde_json::from_str(&json).unwrap();

        assert_eq!(back.status, RunStatus::Running);
        assert_eq!(back.completed_tasks, vec!["a"]);
        assert_eq!(back.total_tokens_used, 100);
    }
}
