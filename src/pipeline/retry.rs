//! Retry plugin
//!
//! Per-session attempt counter. Decides retryability from what previous
//! plugins published on the event and signals the task executor to
//! resubmit via the `__retry` marker.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::llm::{LlmEvent, error_codes};

use super::validation::ValidationDelta;
use super::{InvocationContext, Plugin, keys};

/// Retry policy for a run
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

/// Published under `__retry` when a resubmit is requested
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDelta {
    pub attempt: u32,
    pub max_attempts: u32,
    pub retry: bool,
}

/// Counts attempts per session and requests resubmits
pub struct RetryPlugin {
    config: RetryConfig,
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryPlugin {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Attempts recorded for a session
    pub fn attempts_for(&self, session_id: &str) -> u32 {
        *self.attempts.lock().unwrap().get(session_id).unwrap_or(&0)
    }

    /// Backoff delay before the given attempt, with jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_ms.saturating_mul(1u64 << attempt.min(6));
        let jitter = rand::rng().random_range(0..=base / 4);
        Duration::from_millis(base + jitter)
    }

    fn is_failure(event: &LlmEvent, ctx: &InvocationContext) -> bool {
        if event.is_error() {
            return true;
        }
        ctx.read::<ValidationDelta>(keys::VALIDATION)
            .map(|v| !v.passed)
            .unwrap_or(false)
    }

    fn is_retryable(event: &LlmEvent) -> bool {
        match event.error_code.as_deref() {
            Some(code) => error_codes::is_retryable(code),
            // Validation failures are retryable by definition
            None => true,
        }
    }
}

#[async_trait]
impl Plugin for RetryPlugin {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn after_model(&self, ctx: &mut InvocationContext, event: &mut LlmEvent) {
        if event.partial {
            return;
        }
        if !Self::is_failure(event, ctx) {
            return;
        }

        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(ctx.session_id.clone()).or_insert(0);
        *count += 1;
        let attempt = *count;
        drop(attempts);

        if attempt < self.config.max_attempts && Self::is_retryable(event) {
            debug!(
                task_id = %ctx.task_id,
                attempt,
                max_attempts = self.config.max_attempts,
                "RetryPlugin: requesting resubmit"
            );
            ctx.publish(
                keys::RETRY,
                &RetryDelta {
                    attempt,
                    max_attempts: self.config.max_attempts,
                    retry: true,
                },
            );
        } else {
            debug!(task_id = %ctx.task_id, attempt, "RetryPlugin: attempts exhausted or non-retryable");
            ctx.publish(
                keys::RETRY,
                &RetryDelta {
                    attempt,
                    max_attempts: self.config.max_attempts,
                    retry: false,
                },
            );
        }
    }
}
