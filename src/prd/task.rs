//! Task domain type
//!
//! A Task is the unit of work declared in a PRD. Complexity drives both
//! routing scores and per-request timeouts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Task complexity band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Trivial,
    Simple,
    #[default]
    Moderate,
    Complex,
    Epic,
}

impl Complexity {
    /// Base routing score for this complexity
    pub fn base_score(&self) -> u32 {
        match self {
            Self::Trivial => 10,
            Self::Simple => 25,
            Self::Moderate => 50,
            Self::Complex => 75,
            Self::Epic => 95,
        }
    }

    /// Per-request timeout for LLM invocations at this complexity
    pub fn request_timeout(&self) -> Duration {
        match self {
            Self::Trivial | Self::Simple => Duration::from_secs(120),
            Self::Moderate => Duration::from_secs(300),
            Self::Complex | Self::Epic => Duration::from_secs(600),
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trivial => write!(f, "trivial"),
            Self::Simple => write!(f, "simple"),
            Self::Moderate => write!(f, "moderate"),
            Self::Complex => write!(f, "complex"),
            Self::Epic => write!(f, "epic"),
        }
    }
}

/// Priority for scheduler ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// An acceptance criterion - plain text or structured with a test command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AcceptanceCriterion {
    Text(String),
    Detailed {
        description: String,
        #[serde(rename = "testCommand", skip_serializing_if = "Option::is_none")]
        test_command: Option<String>,
    },
}

impl AcceptanceCriterion {
    /// Human-readable description of the criterion
    pub fn description(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Detailed { description, .. } => description,
        }
    }
}

/// A unit of work declared in a PRD
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique, stable identifier
    pub id: String,

    /// Human-readable title
    pub title: String,

    /// What needs to be done
    pub description: String,

    /// Optional user story framing
    #[serde(rename = "userStory", default, skip_serializing_if = "Option::is_none")]
    pub user_story: Option<String>,

    /// Conditions that must hold for the task to be considered done
    #[serde(default)]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,

    /// Files the task is expected to touch
    #[serde(default)]
    pub files_affected: Vec<String>,

    /// Task ids that must complete first; unknown ids are treated as external
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Complexity band (defaults to moderate)
    #[serde(default)]
    pub complexity: Complexity,

    /// Priority for ordering
    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub labels: Vec<String>,

    #[serde(rename = "relatedFiles", default)]
    pub related_files: Vec<String>,
}

impl Task {
    /// Create a minimal task (used by tests and the typecheck fix pass)
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            user_story: None,
            acceptance_criteria: Vec::new(),
            files_affected: Vec::new(),
            dependencies: Vec::new(),
            complexity: Complexity::default(),
            priority: Priority::default(),
            tags: Vec::new(),
            labels: Vec::new(),
            related_files: Vec::new(),
        }
    }

    /// Agent name derived from the task id
    pub fn agent_name(&self) -> String {
        sanitize_agent_name(&self.id)
    }
}

/// Sanitize a task id into a valid agent name
///
/// Replaces every character outside `[A-Za-z0-9_]` with `_`; if the first
/// character is not a letter or underscore, prefixes `task_`.
pub fn sanitize_agent_name(id: &str) -> String {
    let sanitized: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    match sanitized.chars().next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => sanitized,
        _ => format!("task_{}", sanitized),
    }
}
