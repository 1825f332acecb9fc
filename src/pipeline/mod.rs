//! Plugin pipeline
//!
//! Ordered middleware around every model call. A plugin is a value with
//! default no-op hooks, not a class hierarchy. Plugins communicate only
//! through the state delta under the documented keys in [`keys`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::llm::{LlmError, LlmEvent, LlmRequest};

mod circuit_breaker;
mod context;
mod cost;
mod rate_limit;
mod retry;
mod validation;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPlugin, CircuitSnapshot, CircuitState};
pub use context::{ContextConfig, ContextPlugin, ContextSource, StaticContextSource};
pub use cost::{CostConfig, CostPlugin, CostSnapshot};
pub use rate_limit::{RateLimitConfig, RateLimitPlugin};
pub use retry::{RetryConfig, RetryDelta, RetryPlugin};
pub use validation::{ValidationConfig, ValidationDelta, ValidationPlugin, ValidationStep};

/// The closed namespace of inter-plugin state keys
pub mod keys {
    pub const VALIDATION: &str = "__validation";
    pub const COST: &str = "__cost";
    pub const RETRY: &str = "__retry";
    pub const CIRCUIT_BREAKER: &str = "__circuit_breaker";
    pub const CONTEXT: &str = "__context";
}

/// Per-invocation metadata and the state delta plugins publish into
///
/// The delta is flushed into the session's state between model calls; a
/// plugin must not touch another plugin's keys except through the
/// documented contracts.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub agent_name: String,
    pub task_id: String,
    pub session_id: String,
    pub attempt: u32,
    pub state_delta: HashMap<String, serde_json::Value>,
}

impl InvocationContext {
    /// Create a context for one task invocation
    pub fn new(agent_name: impl Into<String>, task_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            task_id: task_id.into(),
            session_id: session_id.into(),
            attempt: 1,
            state_delta: HashMap::new(),
        }
    }

    /// Publish a typed payload under a state key
    pub fn publish<T: Serialize>(&mut self, key: &str, payload: &T) {
        if let Ok(value) = serde_json::to_value(payload) {
            self.state_delta.insert(key.to_string(), value);
        }
    }

    /// Read a typed payload published under a state key
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.state_delta
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Drain the delta for flushing into the session state
    pub fn take_delta(&mut self) -> HashMap<String, serde_json::Value> {
        std::mem::take(&mut self.state_delta)
    }
}

/// Middleware around model calls
///
/// Every hook has a no-op default; a plugin implements only what it needs.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Name for logs and diagnostics
    fn name(&self) -> &'static str;

    /// Runs before the model call; returning an event short-circuits the
    /// call (later `before_model` hooks are skipped, `after_model` still
    /// runs on the synthetic event).
    async fn before_model(&self, _ctx: &mut InvocationContext, _request: &mut LlmRequest) -> Option<LlmEvent> {
        None
    }

    /// Runs on every received event; may rewrite it in place, and the next
    /// plugin sees the rewritten value.
    async fn after_model(&self, _ctx: &mut InvocationContext, _event: &mut LlmEvent) {}

    /// Runs when the model call itself failed; may substitute a response,
    /// otherwise the error propagates.
    async fn on_model_error(
        &self,
        _ctx: &mut InvocationContext,
        _request: &LlmRequest,
        _error: &LlmError,
    ) -> Option<LlmEvent> {
        None
    }

    /// Terminal hook after the whole task run; no return
    async fn after_run(&self, _ctx: &mut InvocationContext) {}
}

/// Ordered list of plugins; order is fixed at construction
pub struct PluginPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginPipeline {
    /// Build a pipeline from an ordered plugin list
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        debug!(
            plugins = ?plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
            "PluginPipeline::new"
        );
        Self { plugins }
    }

    /// Registered plugin names in order
    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Run every `before_model` hook until one short-circuits
    pub async fn run_before_model(&self, ctx: &mut InvocationContext, request: &mut LlmRequest) -> Option<LlmEvent> {
        for plugin in &self.plugins {
            if let Some(event) = plugin.before_model(ctx, request).await {
                debug!(plugin = plugin.name(), "before_model short-circuited");
                return Some(event);
            }
        }
        None
    }

    /// Run every `after_model` hook in order on one event
    pub async fn run_after_model(&self, ctx: &mut InvocationContext, event: &mut LlmEvent) {
        for plugin in &self.plugins {
            plugin.after_model(ctx, event).await;
        }
    }

    /// Run `on_model_error` hooks until one substitutes a response
    pub async fn run_on_model_error(
        &self,
        ctx: &mut InvocationContext,
        request: &LlmRequest,
        error: &LlmError,
    ) -> Option<LlmEvent> {
        for plugin in &self.plugins {
            if let Some(event) = plugin.on_model_error(ctx, request, error).await {
                debug!(plugin = plugin.name(), "on_model_error substituted a response");
                return Some(event);
            }
        }
        None
    }

    /// Run every terminal `after_run` hook
    pub async fn run_after_run(&self, ctx: &mut InvocationContext) {
        for plugin in &self.plugins {
            plugin.after_run(ctx).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Plugin that records hook invocations and optionally short-circuits
    struct ProbePlugin {
        name: &'static str,
        short_circuit: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Plugin for ProbePlugin {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn before_model(&self, _ctx: &mut InvocationContext, _request: &mut LlmRequest) -> Option<LlmEvent> {
            self.calls.lock().unwrap().push(format!("{}:before", self.name));
            if self.short_circuit {
                Some(LlmEvent::text("synthetic", "short-circuit"))
            } else {
                None
            }
        }

        async fn after_model(&self, _ctx: &mut InvocationContext, event: &mut LlmEvent) {
            self.calls.lock().unwrap().push(format!("{}:after", self.name));
            // Rewrites are visible to the next plugin
            if let Some(crate::llm::ContentPart::Text { text }) = event.content.first_mut() {
                text.push('!');
            }
        }
    }

    fn pipeline_with(probes: Vec<(&'static str, bool)>, calls: Arc<Mutex<Vec<String>>>) -> PluginPipeline {
        let plugins: Vec<Arc<dyn Plugin>> = probes
            .into_iter()
            .map(|(name, short_circuit)| {
                Arc::new(ProbePlugin {
                    name,
                    short_circuit,
                    calls: calls.clone(),
                }) as Arc<dyn Plugin>
            })
            .collect();
        PluginPipeline::new(plugins)
    }

    #[tokio::test]
    async fn test_before_model_runs_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let pipeline = pipeline_with(vec![("a", false), ("b", false)], calls.clone());

        let mut ctx = InvocationContext::new("agent", "t1", "s1");
        let mut request = LlmRequest::new("claude-sonnet", "sys", vec![]);

        assert!(pipeline.run_before_model(&mut ctx, &mut request).await.is_none());
        assert_eq!(calls.lock().unwrap().as_slice(), &["a:before", "b:before"]);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_later_before_hooks() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let pipeline = pipeline_with(vec![("a", true), ("b", false)], calls.clone());

        let mut ctx = InvocationContext::new("agent", "t1", "s1");
        let mut request = LlmRequest::new("claude-sonnet", "sys", vec![]);

        let synthetic = pipeline.run_before_model(&mut ctx, &mut request).await;
        assert!(synthetic.is_some());
        assert_eq!(calls.lock().unwrap().as_slice(), &["a:before"]);
    }

    #[tokio::test]
    async fn test_after_model_rewrites_flow_through_chain() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let pipeline = pipeline_with(vec![("a", false), ("b", false)], calls.clone());

        let mut ctx = InvocationContext::new("agent", "t1", "s1");
        let mut event = LlmEvent::text("model", "hi");

        pipeline.run_after_model(&mut ctx, &mut event).await;
        // Both plugins appended a char, in order
        assert_eq!(event.first_text(), Some("hi!!"));
        assert_eq!(calls.lock().unwrap().as_slice(), &["a:after", "b:after"]);
    }

    #[tokio::test]
    async fn test_context_publish_and_read() {
        let mut ctx = InvocationContext::new("agent", "t1", "s1");

        #[derive(Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Payload {
            passed: bool,
        }

        ctx.publish(keys::VALIDATION, &Payload { passed: false });
        let read: Payload = ctx.read(keys::VALIDATION).unwrap();
        assert_eq!(read, Payload { passed: false });

        let delta = ctx.take_delta();
        assert!(delta.contains_key(keys::VALIDATION));
        assert!(ctx.state_delta.is_empty());
    }
}
