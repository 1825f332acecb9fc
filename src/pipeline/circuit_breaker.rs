//! Circuit breaker plugin
//!
//! Closed/Open/Half-Open state machine over consecutive failures. While
//! open, `before_model` rejects with a synthetic CIRCUIT_BREAKER_OPEN
//! response until the reset timeout elapses; the first request after that
//! is a half-open probe.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::llm::{LlmError, LlmEvent, LlmRequest, error_codes};

use super::validation::ValidationDelta;
use super::{InvocationContext, Plugin, keys};

/// Circuit breaker thresholds
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

/// Circuit states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Value-typed snapshot of circuit statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    total_failures: u64,
    total_successes: u64,
}

/// Notified with the consecutive-failure count when the circuit trips
type TripCallback = Box<dyn Fn(u32) + Send + Sync>;

/// Failure containment around the LLM call
pub struct CircuitBreakerPlugin {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    on_trip: Option<TripCallback>,
}

impl CircuitBreakerPlugin {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                total_failures: 0,
                total_successes: 0,
            }),
            on_trip: None,
        }
    }

    /// Register a callback fired when the circuit transitions to open
    pub fn with_trip_callback(mut self, callback: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_trip = Some(Box::new(callback));
        self
    }

    /// Snapshot current statistics
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock().unwrap();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
        }
    }

    /// Whether requests are currently allowed through
    ///
    /// True in closed and half-open, and in open once the reset timeout has
    /// elapsed (the next request becomes the half-open probe).
    pub fn is_allowing_requests(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => self.reset_elapsed(&inner),
        }
    }

    /// Force the circuit open (privileged)
    pub fn trip(&self) {
        let mut inner = self.inner.lock().unwrap();
        warn!("Circuit breaker manually tripped");
        inner.state = CircuitState::Open;
        inner.last_failure = Some(Instant::now());
    }

    /// Force the circuit closed and clear counters (privileged)
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        info!("Circuit breaker manually reset");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
    }

    fn reset_elapsed(&self, inner: &Inner) -> bool {
        inner
            .last_failure
            .map(|t| t.elapsed() >= Duration::from_millis(self.config.reset_timeout_ms))
            .unwrap_or(true)
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_failures += 1;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        consecutive_failures = inner.consecutive_failures,
                        "Circuit breaker tripped"
                    );
                    inner.state = CircuitState::Open;
                    let failures = inner.consecutive_failures;
                    drop(inner);
                    if let Some(callback) = &self.on_trip {
                        callback(failures);
                    }
                }
            }
            CircuitState::HalfOpen => {
                warn!("Half-open probe failed, reopening circuit");
                inner.state = CircuitState::Open;
                inner.consecutive_failures += 1;
            }
            CircuitState::Open => {}
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_successes += 1;

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                info!("Half-open probe succeeded, closing circuit");
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn event_is_failure(event: &LlmEvent, ctx: &InvocationContext) -> bool {
        if event.is_error() {
            return true;
        }
        ctx.read::<ValidationDelta>(keys::VALIDATION)
            .map(|v| !v.passed)
            .unwrap_or(false)
    }
}

#[async_trait]
impl Plugin for CircuitBreakerPlugin {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    async fn before_model(&self, ctx: &mut InvocationContext, _request: &mut LlmRequest) -> Option<LlmEvent> {
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => None,
            CircuitState::Open => {
                if self.reset_elapsed(&inner) {
                    info!("Reset timeout elapsed, transitioning to half-open");
                    inner.state = CircuitState::HalfOpen;
                    return None;
                }
                debug!(task_id = %ctx.task_id, "Circuit open, rejecting request");
                Some(LlmEvent::error(
                    ctx.agent_name.clone(),
                    error_codes::CIRCUIT_BREAKER_OPEN,
                    "circuit breaker is open",
                ))
            }
        }
    }

    async fn after_model(&self, ctx: &mut InvocationContext, event: &mut LlmEvent) {
        if event.partial {
            return;
        }

        // The circuit's own rejections do not feed its counters
        if event.error_code.as_deref() == Some(error_codes::CIRCUIT_BREAKER_OPEN) {
            return;
        }

        if Self::event_is_failure(event, ctx) {
            self.record_failure();
        } else {
            self.record_success();
        }

        let snapshot = self.snapshot();
        ctx.publish(keys::CIRCUIT_BREAKER, &snapshot);
    }

    async fn on_model_error(
        &self,
        _ctx: &mut InvocationContext,
        _request: &LlmRequest,
        _error: &LlmError,
    ) -> Option<LlmEvent> {
        self.record_failure();
        None
    }
}
