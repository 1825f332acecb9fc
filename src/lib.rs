//! Taskloop - PRD-driven autonomous task orchestrator
//!
//! Taskloop drives a large-language-model through a declarative Product
//! Requirements Document of software-engineering tasks, validating each
//! outcome, retrying on failure, containing blast radius via a circuit
//! breaker, and steering requests across multiple model providers/tiers.
//!
//! # Core Concepts
//!
//! - **Declarative input**: a validated PRD describes tasks, dependencies
//!   and acceptance criteria; the orchestrator decides everything else
//! - **Plugin pipeline**: every model call flows through ordered middleware
//!   (context, rate limit, cost, validation, circuit breaker, retry)
//! - **Score-based routing**: tasks map to model tiers by rule scoring,
//!   corrected by recorded history, escalated on capability failures
//! - **Crash-safe**: orchestrator state checkpoints atomically after every
//!   task boundary and resumes by run id
//!
//! # Modules
//!
//! - [`prd`] - PRD loading, validation, task model
//! - [`llm`] - LLM client trait and the API/CLI/proxy backends
//! - [`router`] - model routing, history learning, provider failover
//! - [`pipeline`] - plugin pipeline and the built-in plugins
//! - [`executor`] - task, parallel, and sequential execution
//! - [`orchestrator`] - the facade that wires a whole run

pub mod cli;
pub mod config;
pub mod events;
pub mod executor;
pub mod llm;
pub mod orchestrator;
pub mod pipeline;
pub mod prd;
pub mod router;
pub mod session;
pub mod signal;
pub mod state;
pub mod util;

// Re-export commonly used types
pub use config::{BackendKind, Config, LlmConfig, OrchestratorConfig};
pub use events::{EventBus, LoopEvent};
pub use executor::{ParallelExecutor, QualityGateConfig, SequentialRunner, TaskExecutionResult, TaskExecutor};
pub use llm::{EventStream, LlmClient, LlmError, LlmEvent, LlmRequest};
pub use orchestrator::{Orchestrator, RunSummary};
pub use pipeline::{
    CircuitBreakerConfig, CircuitBreakerPlugin, ContextPlugin, CostPlugin, Plugin, PluginPipeline, RateLimitPlugin,
    RetryPlugin, ValidationPlugin, ValidationStep,
};
pub use prd::{Complexity, Prd, Task};
pub use router::{FallbackRouter, ModelPreference, ModelRouter, RoutingDecision, Tier};
pub use session::{FileSessionStore, InMemorySessionStore, SessionStore};
pub use state::{CheckpointManager, OrchestratorState, RunStatus};
