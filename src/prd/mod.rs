//! PRD loading and validation
//!
//! A PRD (Product Requirements Document) is the JSON-encoded task list and
//! config that drives a run. Validation is strict: malformed input surfaces
//! a composite error whose message is a `; `-joined list of path+reason pairs.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

mod task;

pub use task::{AcceptanceCriterion, Complexity, Priority, Task, sanitize_agent_name};

/// Errors surfaced while loading or validating a PRD
#[derive(Debug, Error)]
pub enum PrdError {
    #[error("Failed to read PRD file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse PRD: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid PRD: {0}")]
    Invalid(String),
}

/// Optional per-run config embedded in a PRD
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrdRunConfig {
    #[serde(rename = "autoCommit", default, skip_serializing_if = "Option::is_none")]
    pub auto_commit: Option<bool>,

    /// Unrecognized keys are carried through untouched
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// The validated declarative input for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prd {
    pub project: String,

    pub tasks: Vec<Task>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<PrdRunConfig>,
}

impl Prd {
    /// Load and validate a PRD from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PrdError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Prd::load: called");
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse and validate a PRD from a JSON string
    pub fn from_json(content: &str) -> Result<Self, PrdError> {
        let prd: Prd = serde_json::from_str(content)?;
        prd.validate()?;
        Ok(prd)
    }

    /// Validate structural invariants
    ///
    /// Collects every violation and joins them into one message so a user
    /// sees all problems at once.
    pub fn validate(&self) -> Result<(), PrdError> {
        let mut errors = Vec::new();

        if self.project.trim().is_empty() {
            errors.push("project: must not be empty".to_string());
        }

        let mut seen = HashSet::new();
        for (i, task) in self.tasks.iter().enumerate() {
            if task.id.trim().is_empty() {
                errors.push(format!("tasks[{}].id: must not be empty", i));
                continue;
            }
            if !seen.insert(task.id.as_str()) {
                errors.push(format!("tasks[{}].id: duplicate id '{}'", i, task.id));
            }
            if task.title.trim().is_empty() {
                errors.push(format!("tasks[{}].title: must not be empty", i));
            }
            if task.dependencies.iter().any(|d| d == &task.id) {
                errors.push(format!("tasks[{}].dependencies: task '{}' depends on itself", i, task.id));
            }
        }

        if let Err(cycle) = validate_dependency_graph(&self.tasks) {
            errors.push(format!("tasks: dependency cycle detected ({})", cycle.join(" -> ")));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PrdError::Invalid(errors.join("; ")))
        }
    }

    /// Look up a task by id
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// Check the task dependency graph for cycles
///
/// Dependencies pointing at ids not present in the PRD are external and
/// ignored here. Returns the cycle path on failure.
pub fn validate_dependency_graph(tasks: &[Task]) -> Result<(), Vec<String>> {
    let task_map: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut cycle_path = Vec::new();

    for task_id in task_map.keys() {
        if !visited.contains(task_id) && has_cycle_dfs(task_id, &task_map, &mut visited, &mut rec_stack, &mut cycle_path)
        {
            return Err(cycle_path);
        }
    }

    Ok(())
}

/// DFS helper for cycle detection
fn has_cycle_dfs<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, &'a Task>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    cycle_path: &mut Vec<String>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    cycle_path.push(node.to_string());

    if let Some(task) = graph.get(node) {
        for dep_id in &task.dependencies {
            if !visited.contains(dep_id.as_str()) {
                if graph.contains_key(dep_id.as_str())
                    && has_cycle_dfs(dep_id.as_str(), graph, visited, rec_stack, cycle_path)
                {
                    return true;
                }
            } else if rec_stack.contains(dep_id.as_str()) {
                cycle_path.push(dep_id.clone());
                return true;
            }
        }
    }

    rec_stack.remove(node);
    cycle_path.pop();
    false
}
