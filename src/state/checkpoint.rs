//! Checkpoint manager
//!
//! Persists orchestrator state between tasks for crash recovery. Writes
//! are atomic (temp-then-rename); a corrupted checkpoint is discarded with
//! a warning rather than aborting the run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::executor::TaskExecutionResult;

use super::OrchestratorState;

/// Recent task results kept alongside the state
const KEEP_RESULTS: usize = 20;

/// Errors from checkpoint persistence
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A persisted snapshot of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state: OrchestratorState,
    pub recent_results: Vec<TaskExecutionResult>,
    pub saved_at: i64,
}

/// Writes and restores checkpoints keyed by run id
pub struct CheckpointManager {
    dir: PathBuf,
    run_id: String,
}

impl CheckpointManager {
    /// Create a manager for a run
    pub fn new(dir: impl AsRef<Path>, run_id: impl Into<String>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            run_id: run_id.into(),
        })
    }

    fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.run_id))
    }

    /// Persist the state and the tail of recent results
    pub fn save(&self, state: &OrchestratorState, results: &[TaskExecutionResult]) -> Result<(), CheckpointError> {
        let recent = results.iter().rev().take(KEEP_RESULTS).rev().cloned().collect();
        let checkpoint = Checkpoint {
            state: state.clone(),
            recent_results: recent,
            saved_at: crate::util::now_ms(),
        };

        let path = self.path();
        let tmp = self.dir.join(format!("{}.json.tmp", self.run_id));
        std::fs::write(&tmp, serde_json::to_string_pretty(&checkpoint)?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), completed = checkpoint.state.completed_tasks.len(), "Checkpoint saved");
        Ok(())
    }

    /// Load the checkpoint for this run id, if one exists and parses
    pub fn load(&self) -> Option<Checkpoint> {
        let path = self.path();
        if !path.exists() {
            return None;
        }

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read checkpoint");
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding corrupted checkpoint");
                None
            }
        }
    }

    /// Remove the checkpoint (after a clean completion)
    pub fn clear(&self) -> Result<(), CheckpointError> {
        let path = self.path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunStatus;
    use tempfile::tempdir;

    fn result(task_id: &str) -> TaskExecutionResult {
        TaskExecutionResult {
            task_id: task_id.to_string(),
            success: true,
            attempts: 1,
            tokens_used: 10,
            cost_usd: 0.001,
            duration_ms: 5,
            file_changes: vec![],
            error: None,
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "run-1").unwrap();

        let mut state = OrchestratorState::new("run-1");
        state.status = RunStatus::Running;
        state.completed_tasks.push("a".to_string());

        manager.save(&state, &[result("a")]).unwrap();

        let checkpoint = manager.load().unwrap();
        assert_eq!(checkpoint.state.completed_tasks, vec!["a"]);
        assert_eq!(checkpoint.state.status, RunStatus::Running);
        assert_eq!(checkpoint.recent_results.len(), 1);
    }

    #[test]
    fn test_resume_is_idempotent() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "run-1").unwrap();

        let mut state = OrchestratorState::new("run-1");
        state.completed_tasks.push("a".to_string());
        manager.save(&state, &[result("a")]).unwrap();

        // Loading twice yields identical state
        let first = manager.load().unwrap();
        let second = manager.load().unwrap();
        assert_eq!(
            serde_json::to_string(&first.state).unwrap(),
            serde_json::to_string(&second.state).unwrap()
        );
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "nope").unwrap();
        assert!(manager.load().is_none());
    }

    #[test]
    fn test_corrupted_checkpoint_discarded() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "run-1").unwrap();
        std::fs::write(dir.path().join("run-1.json"), "{ truncated").unwrap();

        assert!(manager.load().is_none());
    }

    #[test]
    fn test_keeps_only_recent_results() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "run-1").unwrap();

        let results: Vec<TaskExecutionResult> = (0..30).map(|i| result(&format!("t{}", i))).collect();
        manager.save(&OrchestratorState::new("run-1"), &results).unwrap();

        let checkpoint = manager.load().unwrap();
        assert_eq!(checkpoint.recent_results.len(), 20);
        // The tail is kept, oldest dropped
        assert_eq!(checkpoint.recent_results.last().unwrap().task_id, "t29");
        assert_eq!(checkpoint.recent_results.first().unwrap().task_id, "t10");
    }

    #[test]
    fn test_clear_removes_checkpoint() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "run-1").unwrap();

        manager.save(&OrchestratorState::new("run-1"), &[]).unwrap();
        manager.clear().unwrap();
        assert!(manager.load().is_none());
    }

    #[test]
    fn test_runs_are_keyed_independently() {
        let dir = tempdir().unwrap();
        let first = CheckpointManager::new(dir.path(), "run-1").unwrap();
        let second = CheckpointManager::new(dir.path(), "run-2").unwrap();

        let mut state = OrchestratorState::new("run-1");
        state.completed_tasks.push("a".to_string());
        first.save(&state, &[]).unwrap();

        assert!(second.load().is_none());
    }
}
