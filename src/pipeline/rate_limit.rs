//! Rate-limit plugin
//!
//! Token bucket per provider. `before_model` consumes one token or waits
//! cooperatively up to `max_wait`; waits beyond that produce a synthetic
//! RATE_LIMITED response.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::llm::{LlmEvent, LlmRequest, error_codes};

use super::{InvocationContext, Plugin};

/// Sleep granularity while waiting for a token
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Token bucket parameters
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub max_wait_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_sec: 1.0,
            max_wait_ms: 30_000,
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Provider a model name bills against
fn provider_for_model(model: &str) -> &'static str {
    if model.contains("claude") {
        "anthropic"
    } else if model.contains("gemini") {
        "google"
    } else {
        "default"
    }
}

/// Per-provider token buckets
pub struct RateLimitPlugin {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<&'static str, Bucket>>,
}

impl RateLimitPlugin {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take one token; on failure return the wait until one refills
    fn try_take(&self, provider: &'static str) -> Result<(), Duration> {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(provider).or_insert_with(|| Bucket {
            tokens: self.config.capacity,
            last_refill: Instant::now(),
        });

        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.config.refill_per_sec).min(self.config.capacity);
        bucket.last_refill = Instant::now();

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(deficit / self.config.refill_per_sec))
        }
    }

    /// Remaining tokens for a provider (for diagnostics)
    pub fn available(&self, model: &str) -> f64 {
        let provider = provider_for_model(model);
        let buckets = self.buckets.lock().unwrap();
        buckets.get(provider).map(|b| b.tokens).unwrap_or(self.config.capacity)
    }
}

#[async_trait]
impl Plugin for RateLimitPlugin {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn before_model(&self, ctx: &mut InvocationContext, request: &mut LlmRequest) -> Option<LlmEvent> {
        let provider = provider_for_model(&request.model);
        let max_wait = Duration::from_millis(self.config.max_wait_ms);
        let started = Instant::now();

        loop {
            match self.try_take(provider) {
                Ok(()) => return None,
                Err(wait) => {
                    if started.elapsed() + wait > max_wait {
                        debug!(task_id = %ctx.task_id, provider, "Rate limit wait exceeds max_wait");
                        return Some(LlmEvent::error(
                            ctx.agent_name.clone(),
                            error_codes::RATE_LIMITED,
                            format!("rate limit on provider '{}' exceeds max wait {:?}", provider, max_wait),
                        ));
                    }
                    tokio::time::sleep(wait.min(POLL_INTERVAL)).await;
                }
            }
        }
    }
}
