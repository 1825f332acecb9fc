//! Model router
//!
//! Maps a task to a model tier and name via rule scoring, history, and
//! explicit preference; owns the escalation cascade configuration.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::prd::Task;

use super::history::{RoutingHistory, TaskSignature};

/// Cost/capability band over model names
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Cheap,
    Mid,
    Premium,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cheap => write!(f, "cheap"),
            Self::Mid => write!(f, "mid"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

/// Where a routing decision came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteSource {
    Rule,
    History,
    Preference,
    Escalation,
}

/// How the task should be executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Single,
    Multi,
}

/// Scheduling hint derived from tier and score
///
/// Informs scheduling only; it never changes the pipeline shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub mode: ExecutionMode,
    pub parallelizable: bool,
    pub suggested_agent_count: u32,
    pub reason: String,
}

/// Caller-supplied routing preference
#[derive(Debug, Clone, Default)]
pub struct ModelPreference {
    pub model: Option<String>,
    pub min_tier: Option<Tier>,
    pub no_cascade: bool,
}

/// The outcome of routing one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub task_id: String,
    pub selected_model: String,
    pub tier: Tier,
    pub source: RouteSource,
    pub score: u32,
    pub can_escalate: bool,
    pub escalation_path: Vec<String>,
    pub execution: ExecutionPlan,
}

/// Closed tag weight table
fn tag_weight(tag: &str) -> i64 {
    match tag {
        "architecture" => 20,
        "security" => 15,
        "migration" => 15,
        "performance" => 10,
        "refactor" => 10,
        "database" => 10,
        "api" => 5,
        "cleanup" => -5,
        "docs" => -10,
        "rename" => -10,
        "lint" => -15,
        "comment" => -15,
        "formatting" => -20,
        "typo" => -25,
        _ => 0,
    }
}

/// Score a task 0-100 from its attributes
pub fn score_task(task: &Task) -> u32 {
    let base = i64::from(task.complexity.base_score());
    let files_boost = ((task.files_affected.len() as i64) - 2).max(0) * 5;
    let criteria_boost = ((task.acceptance_criteria.len() as i64) - 2).max(0) * 3;
    let tags_boost: i64 = task.tags.iter().map(|t| tag_weight(t)).sum();

    (base + files_boost + criteria_boost + tags_boost).clamp(0, 100) as u32
}

/// Tier for a score
pub fn tier_for_score(score: u32) -> Tier {
    match score {
        0..=35 => Tier::Cheap,
        36..=65 => Tier::Mid,
        _ => Tier::Premium,
    }
}

/// Closed model catalog, ordered within each tier
///
/// The first model of a tier is its default.
const CHEAP_MODELS: &[&str] = &["gemini-flash", "claude-haiku"];
const MID_MODELS: &[&str] = &["gemini-pro", "claude-sonnet"];
const PREMIUM_MODELS: &[&str] = &["claude-opus"];

/// Models available in a tier, in fixed order
pub fn models_in_tier(tier: Tier) -> &'static [&'static str] {
    match tier {
        Tier::Cheap => CHEAP_MODELS,
        Tier::Mid => MID_MODELS,
        Tier::Premium => PREMIUM_MODELS,
    }
}

/// Tier a model belongs to, if it is in the catalog
pub fn tier_of_model(model: &str) -> Option<Tier> {
    for tier in [Tier::Cheap, Tier::Mid, Tier::Premium] {
        if models_in_tier(tier).contains(&model) {
            return Some(tier);
        }
    }
    None
}

/// Escalation path for a model: remaining models of its tier, then every
/// model of strictly higher tiers. Premium cannot escalate.
fn escalation_path(model: &str, tier: Tier) -> Vec<String> {
    let mut path: Vec<String> = models_in_tier(tier)
        .iter()
        .filter(|m| **m != model)
        .map(|m| m.to_string())
        .collect();

    let higher: &[Tier] = match tier {
        Tier::Cheap => &[Tier::Mid, Tier::Premium],
        Tier::Mid => &[Tier::Premium],
        Tier::Premium => &[],
    };
    for t in higher {
        path.extend(models_in_tier(*t).iter().map(|m| m.to_string()));
    }
    path
}

fn execution_plan(tier: Tier, score: u32, forced_single: bool) -> ExecutionPlan {
    if forced_single {
        return ExecutionPlan {
            mode: ExecutionMode::Single,
            parallelizable: false,
            suggested_agent_count: 1,
            reason: "explicit model preference".to_string(),
        };
    }

    match tier {
        Tier::Cheap | Tier::Mid => ExecutionPlan {
            mode: ExecutionMode::Single,
            parallelizable: false,
            suggested_agent_count: 1,
            reason: "single agent sufficient".to_string(),
        },
        Tier::Premium => ExecutionPlan {
            mode: ExecutionMode::Multi,
            parallelizable: true,
            suggested_agent_count: score.div_ceil(25).min(5),
            reason: "parallel subtasks".to_string(),
        },
    }
}

/// Routes tasks to models; thread-safe, history behind a mutex
pub struct ModelRouter {
    history: Mutex<RoutingHistory>,
}

impl ModelRouter {
    /// Create a router with the given history
    pub fn new(history: RoutingHistory) -> Self {
        Self {
            history: Mutex::new(history),
        }
    }

    /// Route a task to a model
    ///
    /// Selection order: explicit preference, then history override, then
    /// rule-based tier default.
    pub fn route(&self, task: &Task, preference: &ModelPreference) -> RoutingDecision {
        let score = score_task(task);

        // 1. Explicit preference wins outright
        if let Some(model) = &preference.model {
            let tier = tier_of_model(model).unwrap_or_else(|| tier_for_score(score));
            let can_escalate = !preference.no_cascade && tier != Tier::Premium;
            let decision = RoutingDecision {
                task_id: task.id.clone(),
                selected_model: model.clone(),
                tier,
                source: RouteSource::Preference,
                score: 100,
                can_escalate,
                escalation_path: if can_escalate { escalation_path(model, tier) } else { Vec::new() },
                execution: execution_plan(tier, score, true),
            };
            debug!(task_id = %task.id, model = %decision.selected_model, "route: explicit preference");
            return decision;
        }

        let mut tier = tier_for_score(score);
        if let Some(min_tier) = preference.min_tier {
            tier = tier.max(min_tier);
        }

        // 2. History-based override for this signature
        let signature = TaskSignature::from_task(task);
        let history_pick = {
            let history = self.history.lock().unwrap();
            history.best_model(&signature).map(|p| p.model.clone())
        };

        if let Some(model) = history_pick {
            let history_tier = tier_of_model(&model).unwrap_or(tier).max(preference.min_tier.unwrap_or(Tier::Cheap));
            let can_escalate = !preference.no_cascade && history_tier != Tier::Premium;
            let decision = RoutingDecision {
                task_id: task.id.clone(),
                selected_model: model.clone(),
                tier: history_tier,
                source: RouteSource::History,
                score,
                can_escalate,
                escalation_path: if can_escalate {
                    escalation_path(&model, history_tier)
                } else {
                    Vec::new()
                },
                execution: execution_plan(history_tier, score, false),
            };
            debug!(task_id = %task.id, model = %decision.selected_model, "route: history override");
            return decision;
        }

        // 3. Rule-based: default model of the tier
        let model = models_in_tier(tier)[0].to_string();
        let can_escalate = !preference.no_cascade && tier != Tier::Premium;
        let decision = RoutingDecision {
            task_id: task.id.clone(),
            selected_model: model.clone(),
            tier,
            source: RouteSource::Rule,
            score,
            can_escalate,
            escalation_path: if can_escalate { escalation_path(&model, tier) } else { Vec::new() },
            execution: execution_plan(tier, score, false),
        };
        debug!(task_id = %task.id, model = %decision.selected_model, score, "route: rule-based");
        decision
    }

    /// Advance a decision one step along its escalation path
    ///
    /// Returns None when the cascade is exhausted or disabled.
    pub fn next_escalation(&self, decision: &RoutingDecision) -> Option<RoutingDecision> {
        if !decision.can_escalate {
            return None;
        }

        let mut path = decision.escalation_path.iter();
        let next_model = path.next()?.clone();
        let remaining: Vec<String> = path.cloned().collect();
        let tier = tier_of_model(&next_model).unwrap_or(decision.tier);

        Some(RoutingDecision {
            task_id: decision.task_id.clone(),
            selected_model: next_model,
            tier,
            source: RouteSource::Escalation,
            score: decision.score,
            can_escalate: !remaining.is_empty(),
            escalation_path: remaining,
            execution: decision.execution.clone(),
        })
    }

    /// Record a task outcome into history
    pub fn record_outcome(&self, task: &Task, model: &str, success: bool, cost: f64) {
        let signature = TaskSignature::from_task(task);
        self.history.lock().unwrap().record(&signature, model, success, cost);
    }

    /// Persist history to disk
    pub fn save_history(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        self.history.lock().unwrap().save(path)
    }
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::new(RoutingHistory::new())
    }
}
