//! Routing history
//!
//! Records per-signature outcomes so the router can learn which model
//! actually succeeds for a class of tasks. Persisted as JSON under the
//! state directory; corrupt files are discarded with a warning.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::prd::{Complexity, Task};
use crate::util::now_ms;

/// Attempts required before history can override the rule-based tier
pub const MIN_ATTEMPTS_FOR_OVERRIDE: u32 = 3;

/// Bucketed file count for signature derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesRange {
    /// 0-2 files
    Few,
    /// 3-5 files
    Some,
    /// 6+ files
    Many,
}

impl FilesRange {
    /// Bucket a file count
    pub fn from_count(count: usize) -> Self {
        match count {
            0..=2 => Self::Few,
            3..=5 => Self::Some,
            _ => Self::Many,
        }
    }
}

impl std::fmt::Display for FilesRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Few => write!(f, "few"),
            Self::Some => write!(f, "some"),
            Self::Many => write!(f, "many"),
        }
    }
}

/// Compact signature of a task's routing-relevant attributes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskSignature {
    pub complexity: Complexity,
    pub tags: Vec<String>,
    pub files_range: FilesRange,
}

impl TaskSignature {
    /// Derive the signature from a task
    pub fn from_task(task: &Task) -> Self {
        let mut tags = task.tags.clone();
        tags.sort();
        Self {
            complexity: task.complexity,
            tags,
            files_range: FilesRange::from_count(task.files_affected.len()),
        }
    }

    /// Stable string key used to index history records
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.complexity, self.tags.join(","), self.files_range)
    }
}

/// Outcome record for one (signature, model) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPattern {
    pub model: String,
    pub success_count: u32,
    pub fail_count: u32,
    pub avg_cost: f64,
    pub last_updated: i64,
}

impl RoutingPattern {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            success_count: 0,
            fail_count: 0,
            avg_cost: 0.0,
            last_updated: now_ms(),
        }
    }

    /// Total recorded attempts
    pub fn attempts(&self) -> u32 {
        self.success_count + self.fail_count
    }

    /// Fraction of attempts that succeeded
    pub fn success_rate(&self) -> f64 {
        let attempts = self.attempts();
        if attempts == 0 {
            return 0.0;
        }
        f64::from(self.success_count) / f64::from(attempts)
    }

    fn record(&mut self, success: bool, cost: f64) {
        let attempts = f64::from(self.attempts());
        self.avg_cost = (self.avg_cost * attempts + cost) / (attempts + 1.0);
        if success {
            self.success_count += 1;
        } else {
            self.fail_count += 1;
        }
        self.last_updated = now_ms();
    }
}

/// All recorded routing patterns, keyed by signature
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RoutingHistory {
    patterns: HashMap<String, Vec<RoutingPattern>>,
}

impl RoutingHistory {
    /// Empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Load history from a JSON file; missing or corrupt files yield empty history
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::new();
        }

        match std::fs::read_to_string(path).map_err(|e| e.to_string()).and_then(|s| {
            serde_json::from_str::<Self>(&s).map_err(|e| e.to_string())
        }) {
            Ok(history) => {
                debug!(path = %path.display(), signatures = history.patterns.len(), "RoutingHistory::load");
                history
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding corrupt routing history");
                Self::new()
            }
        }
    }

    /// Persist history atomically (temp-then-rename)
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)
    }

    /// Record the outcome of one attempt
    pub fn record(&mut self, signature: &TaskSignature, model: &str, success: bool, cost: f64) {
        let key = signature.key();
        let patterns = self.patterns.entry(key).or_default();

        let pattern = match patterns.iter_mut().find(|p| p.model == model) {
            Some(p) => p,
            None => {
                patterns.push(RoutingPattern::new(model));
                patterns.last_mut().unwrap()
            }
        };

        pattern.record(success, cost);
    }

    /// Best past model for a signature, if history is strong enough
    ///
    /// Requires at least `MIN_ATTEMPTS_FOR_OVERRIDE` attempts on the winning
    /// model and a success rate above 0.5 (the confidence threshold).
    pub fn best_model(&self, signature: &TaskSignature) -> Option<&RoutingPattern> {
        let patterns = self.patterns.get(&signature.key())?;

        patterns
            .iter()
            .filter(|p| p.attempts() >= MIN_ATTEMPTS_FOR_OVERRIDE)
            .max_by(|a, b| {
                a.success_rate()
                    .partial_cmp(&b.success_rate())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .filter(|p| p.success_rate() > 0.5)
    }

    /// Number of recorded signatures
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether any signature has been recorded
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
