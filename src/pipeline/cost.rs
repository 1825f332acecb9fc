//! Cost plugin
//!
//! Accumulates token usage, prices it by model name, and enforces budget
//! caps. Totals are a documented cross-task aggregate behind a mutex;
//! everything else is per-call.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::llm::{LlmEvent, error_codes};

use super::{InvocationContext, Plugin, keys};

/// Budget caps for a run
#[derive(Debug, Clone, Default)]
pub struct CostConfig {
    pub max_cost_usd: Option<f64>,
    pub max_tokens: Option<u64>,
}

/// Value-typed snapshot of accumulated totals
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

/// Published under `__cost` after each priced event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostDelta {
    pub current: f64,
    pub total: f64,
}

#[derive(Default)]
struct Totals {
    tokens: u64,
    cost_usd: f64,
    budget_tripped: bool,
}

/// Per-million-token pricing by model name (input, output)
///
/// Unknown models price at zero with a warning.
fn price_for(model: &str) -> Option<(f64, f64)> {
    match model {
        m if m.contains("opus") => Some((15.0, 75.0)),
        m if m.contains("sonnet") => Some((3.0, 15.0)),
        m if m.contains("haiku") => Some((0.25, 1.25)),
        m if m.contains("gemini-pro") => Some((1.25, 5.0)),
        m if m.contains("gemini-flash") => Some((0.075, 0.30)),
        _ => None,
    }
}

/// Compute the USD cost of one priced event
fn cost_usd(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let Some((input_price, output_price)) = price_for(model) else {
        warn!(%model, "Unknown model in pricing table, costing zero");
        return 0.0;
    };

    (input_tokens as f64 / 1_000_000.0) * input_price + (output_tokens as f64 / 1_000_000.0) * output_price
}

/// Tracks cost totals and enforces budget caps
pub struct CostPlugin {
    config: CostConfig,
    model: String,
    totals: Mutex<Totals>,
}

impl CostPlugin {
    /// Create the plugin for a run
    ///
    /// `model` is the default model used for pricing; events do not carry
    /// the model name.
    pub fn new(config: CostConfig, model: impl Into<String>) -> Self {
        Self {
            config,
            model: model.into(),
            totals: Mutex::new(Totals::default()),
        }
    }

    /// Seed totals restored from a checkpoint so budget caps count prior spend
    pub fn with_initial_totals(self, tokens: u64, cost_usd: f64) -> Self {
        {
            let mut totals = self.totals.lock().unwrap();
            totals.tokens = tokens;
            totals.cost_usd = cost_usd;
        }
        self
    }

    /// Snapshot the accumulated totals
    pub fn snapshot(&self) -> CostSnapshot {
        let totals = self.totals.lock().unwrap();
        CostSnapshot {
            total_tokens: totals.tokens,
            total_cost_usd: totals.cost_usd,
        }
    }

    /// Whether accumulated totals exceed a configured cap
    ///
    /// The orchestrator checks this between tasks to stop the run.
    pub fn budget_exceeded(&self) -> Option<String> {
        let totals = self.totals.lock().unwrap();
        if let Some(max_cost) = self.config.max_cost_usd
            && totals.cost_usd > max_cost
        {
            return Some(format!(
                "{}: total cost ${:.4} exceeds cap ${:.4}",
                error_codes::BUDGET_EXCEEDED,
                totals.cost_usd,
                max_cost
            ));
        }
        if let Some(max_tokens) = self.config.max_tokens
            && totals.tokens > max_tokens
        {
            return Some(format!(
                "{}: total tokens {} exceeds cap {}",
                error_codes::TOKEN_LIMIT_EXCEEDED,
                totals.tokens,
                max_tokens
            ));
        }
        None
    }
}

#[async_trait]
impl Plugin for CostPlugin {
    fn name(&self) -> &'static str {
        "cost"
    }

    async fn after_model(&self, ctx: &mut InvocationContext, event: &mut LlmEvent) {
        if event.partial {
            return;
        }
        let Some(usage) = &event.usage else {
            return;
        };

        let current = cost_usd(&self.model, usage.prompt_token_count, usage.candidates_token_count);

        let mut totals = self.totals.lock().unwrap();

        // Budget is checked against what was already spent, so the event
        // that crosses a cap still lands; the NEXT priced call is rejected.
        // Enforcement fires at most once per run.
        let over_cost = self
            .config
            .max_cost_usd
            .map(|max| totals.cost_usd > max)
            .unwrap_or(false);
        let over_tokens = self.config.max_tokens.map(|max| totals.tokens > max).unwrap_or(false);

        totals.tokens += usage.total_token_count;
        totals.cost_usd += current;

        debug!(
            task_id = %ctx.task_id,
            current,
            total = totals.cost_usd,
            tokens = totals.tokens,
            "CostPlugin::after_model"
        );

        ctx.publish(
            keys::COST,
            &CostDelta {
                current,
                total: totals.cost_usd,
            },
        );

        if totals.budget_tripped {
            return;
        }

        if over_cost {
            totals.budget_tripped = true;
            let max_cost = self.config.max_cost_usd.unwrap_or_default();
            warn!(total = totals.cost_usd, max_cost, "Budget exceeded");
            event.error_code = Some(error_codes::BUDGET_EXCEEDED.to_string());
            event.error_message = Some(format!(
                "{}: total cost ${:.4} exceeds cap ${:.4}",
                error_codes::BUDGET_EXCEEDED,
                totals.cost_usd,
                max_cost
            ));
            return;
        }

        if over_tokens {
            totals.budget_tripped = true;
            let max_tokens = self.config.max_tokens.unwrap_or_default();
            warn!(tokens = totals.tokens, max_tokens, "Token limit exceeded");
            event.error_code = Some(error_codes::TOKEN_LIMIT_EXCEEDED.to_string());
            event.error_message = Some(format!(
                "{}: total tokens {} exceeds cap {}",
                error_codes::TOKEN_LIMIT_EXCEEDED,
                totals.tokens,
                max_tokens
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn priced_event(input: u64, output: u64) -> LlmEvent {
        LlmEvent::text("model", "done").with_usage(input, output)
    }

    #[tokio::test]
    async fn test_accumulates_sonnet_pricing() {
        let plugin = CostPlugin::new(CostConfig::default(), "claude-sonnet");
        let mut ctx = InvocationContext::new("agent", "t1", "s1");

        let mut event = priced_event(1_000_000, 100_000);
        plugin.after_model(&mut ctx, &mut event).await;

        let snapshot = plugin.snapshot();
        // $3 input + $1.50 output
        assert!((snapshot.total_cost_usd - 4.5).abs() < 1e-9);
        assert_eq!(snapshot.total_tokens, 1_100_000);

        let delta: CostDelta = ctx.read(keys::COST).unwrap();
        assert!((delta.current - 4.5).abs() < 1e-9);
        assert!((delta.total - 4.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_partial_events_ignored() {
        let plugin = CostPlugin::new(CostConfig::default(), "claude-sonnet");
        let mut ctx = InvocationContext::new("agent", "t1", "s1");

        let mut event = priced_event(1000, 1000);
        event.partial = true;
        plugin.after_model(&mut ctx, &mut event).await;

        assert_eq!(plugin.snapshot().total_tokens, 0);
        assert!(ctx.read::<CostDelta>(keys::COST).is_none());
    }

    #[tokio::test]
    async fn test_unknown_model_costs_zero() {
        let plugin = CostPlugin::new(CostConfig::default(), "mystery-model");
        let mut ctx = InvocationContext::new("agent", "t1", "s1");

        let mut event = priced_event(1_000_000, 1_000_000);
        plugin.after_model(&mut ctx, &mut event).await;

        let snapshot = plugin.snapshot();
        assert_eq!(snapshot.total_cost_usd, 0.0);
        // Tokens still accumulate
        assert_eq!(snapshot.total_tokens, 2_000_000);
    }

    #[tokio::test]
    async fn test_crossing_event_lands_next_call_rejected() {
        let plugin = CostPlugin::new(
            CostConfig {
                max_cost_usd: Some(0.01),
                max_tokens: None,
            },
            "claude-sonnet",
        );
        let mut ctx = InvocationContext::new("agent", "t1", "s1");

        // The event that crosses the cap still lands untouched
        let mut first = priced_event(100_000, 0); // $0.30
        plugin.after_model(&mut ctx, &mut first).await;
        assert!(!first.is_error());
        assert!((plugin.snapshot().total_cost_usd - 0.30).abs() < 1e-9);
        assert!(plugin.budget_exceeded().unwrap().contains("BUDGET_EXCEEDED"));

        // The next priced event is rewritten
        let mut second = priced_event(100_000, 0);
        plugin.after_model(&mut ctx, &mut second).await;
        assert_eq!(second.error_code.as_deref(), Some(error_codes::BUDGET_EXCEEDED));
        assert!(second.error_message.as_deref().unwrap().contains("BUDGET_EXCEEDED"));
    }

    #[tokio::test]
    async fn test_budget_rewrite_fires_at_most_once() {
        let plugin = CostPlugin::new(
            CostConfig {
                max_cost_usd: Some(0.01),
                max_tokens: None,
            },
            "claude-sonnet",
        );
        let mut ctx = InvocationContext::new("agent", "t1", "s1");

        let mut first = priced_event(100_000, 0);
        plugin.after_model(&mut ctx, &mut first).await;
        let mut second = priced_event(100_000, 0);
        plugin.after_model(&mut ctx, &mut second).await;
        assert!(second.is_error());

        let mut third = priced_event(100_000, 0);
        plugin.after_model(&mut ctx, &mut third).await;
        // Totals keep accumulating but the rewrite already fired
        assert!(!third.is_error());
        assert!(plugin.snapshot().total_cost_usd > 0.5);
    }

    #[tokio::test]
    async fn test_token_cap() {
        let plugin = CostPlugin::new(
            CostConfig {
                max_cost_usd: None,
                max_tokens: Some(1000),
            },
            "claude-haiku",
        );
        let mut ctx = InvocationContext::new("agent", "t1", "s1");

        let mut first = priced_event(900, 200);
        plugin.after_model(&mut ctx, &mut first).await;
        assert!(!first.is_error());

        let mut second = priced_event(10, 10);
        plugin.after_model(&mut ctx, &mut second).await;
        assert_eq!(second.error_code.as_deref(), Some(error_codes::TOKEN_LIMIT_EXCEEDED));
    }

    #[test]
    fn test_cost_totals_monotonic() {
        // cost_usd never returns negative
        assert!(cost_usd("claude-opus", 0, 0) >= 0.0);
        assert!(cost_usd("gemini-flash", 10, 10) > 0.0);
    }
}
