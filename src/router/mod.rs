//! Model routing
//!
//! Rule scoring, history learning, cascade escalation, and provider
//! failover.

mod fallback;
mod history;
mod model;

pub use fallback::{DEFAULT_PROBE_TIMEOUT, FallbackRouter, HealthMonitor, HttpHealthMonitor, ProviderEndpoint};
pub use history::{FilesRange, MIN_ATTEMPTS_FOR_OVERRIDE, RoutingHistory, RoutingPattern, TaskSignature};
pub use model::{
    ExecutionMode, ExecutionPlan, ModelPreference, ModelRouter, RouteSource, RoutingDecision, Tier, models_in_tier,
    score_task, tier_for_score, tier_of_model,
};
