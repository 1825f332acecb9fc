//! Lifecycle event types
//!
//! The closed vocabulary of orchestrator activity. Every event carries an
//! ISO-8601 timestamp and an event-specific payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Core event enum - the orchestrator's closed activity vocabulary
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    LoopStarted {
        timestamp: DateTime<Utc>,
        run_id: String,
        project: String,
        total_tasks: usize,
    },
    LoopCompleted {
        timestamp: DateTime<Utc>,
        run_id: String,
        completed: usize,
        failed: usize,
        skipped: usize,
        total_cost_usd: f64,
    },
    LoopFailed {
        timestamp: DateTime<Utc>,
        run_id: String,
        error: String,
    },
    LoopCancelling {
        timestamp: DateTime<Utc>,
        run_id: String,
        reason: String,
    },
    TaskStarted {
        timestamp: DateTime<Utc>,
        task_id: String,
        title: String,
        model: String,
    },
    TaskCompleted {
        timestamp: DateTime<Utc>,
        task_id: String,
        attempts: u32,
        cost_usd: f64,
        duration_ms: u64,
    },
    TaskFailed {
        timestamp: DateTime<Utc>,
        task_id: String,
        error: String,
        attempts: u32,
    },
    AttemptStarted {
        timestamp: DateTime<Utc>,
        task_id: String,
        attempt: u32,
        max_attempts: u32,
    },
    ValidationCompleted {
        timestamp: DateTime<Utc>,
        task_id: String,
        passed: bool,
        failed_steps: Vec<String>,
        duration_ms: u64,
    },
    CostUpdate {
        timestamp: DateTime<Utc>,
        total_tokens: u64,
        total_cost_usd: f64,
    },
    CircuitBreakerTripped {
        timestamp: DateTime<Utc>,
        consecutive_failures: u32,
    },
}

impl LoopEvent {
    /// Event type name as a snake_case string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::LoopStarted { .. } => "loop_started",
            Self::LoopCompleted { .. } => "loop_completed",
            Self::LoopFailed { .. } => "loop_failed",
            Self::LoopCancelling { .. } => "loop_cancelling",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::AttemptStarted { .. } => "attempt_started",
            Self::ValidationCompleted { .. } => "validation_completed",
            Self::CostUpdate { .. } => "cost_update",
            Self::CircuitBreakerTripped { .. } => "circuit_breaker_tripped",
        }
    }

    /// Task id for task-scoped events
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskStarted { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::AttemptStarted { task_id, .. }
            | Self::ValidationCompleted { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// Timestamp the event was created
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::LoopStarted { timestamp, .. }
            | Self::LoopCompleted { timestamp, .. }
            | Self::LoopFailed { timestamp, .. }
            | Self::LoopCancelling { timestamp, .. }
            | Self::TaskStarted { timestamp, .. }
            | Self::TaskCompleted { timestamp, .. }
            | Self::TaskFailed { timestamp, .. }
            | Self::AttemptStarted { timestamp, .. }
            | Self::ValidationCompleted { timestamp, .. }
            | Self::CostUpdate { timestamp, .. }
            | Self::CircuitBreakerTripped { timestamp, .. } => *timestamp,
        }
    }
}
