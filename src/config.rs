//! Configuration types and loading

use std::path::PathBuf;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::executor::QualityGateConfig;
use crate::pipeline::{CircuitBreakerConfig, RateLimitConfig, ValidationStep};

/// LLM backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Api,
    #[default]
    Cli,
    Proxy,
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name ("anthropic", "google", "proxy")
    pub provider: String,

    /// Default model identifier
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Command for the CLI backend
    pub command: String,

    /// Extra arguments for the CLI backend
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 16384,
            timeout_ms: 300_000,
            command: "claude".to_string(),
            args: Vec::new(),
        }
    }
}

/// File-backed defaults loaded by the CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Directory for sessions, checkpoints and routing history
    #[serde(rename = "state-dir")]
    pub state_dir: Option<PathBuf>,

    /// Validation steps run after each model response
    #[serde(rename = "validation-steps")]
    pub validation_steps: Vec<ValidationStep>,

    /// Typecheck command for the final fix pass
    #[serde(rename = "typecheck-command")]
    pub typecheck_command: Option<String>,
}

impl Config {
    /// Load configuration with a fallback chain
    ///
    /// Explicit path, then project-local `.taskloop.yml`, then the user
    /// config dir, then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".taskloop.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("taskloop").join("taskloop.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Default state directory when the config does not set one
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("taskloop")
        })
    }
}

/// Constructor configuration for the orchestrator
///
/// `project_root` is required; everything else has a workable default.
#[derive(Clone)]
pub struct OrchestratorConfig {
    pub project_root: PathBuf,
    pub prd_path: Option<PathBuf>,
    pub model: Option<String>,
    pub backend: BackendKind,
    pub llm: LlmConfig,
    pub max_attempts: u32,
    pub max_cost_usd: Option<f64>,
    pub max_tokens: Option<u64>,
    pub validation_steps: Vec<ValidationStep>,
    pub fail_fast_validation: bool,
    pub continue_on_failure: bool,
    pub enable_context: bool,
    pub enable_memory: bool,
    pub enable_git_auto_commit: bool,
    pub quality_gate: Option<QualityGateConfig>,
    pub dry_run: bool,
    pub verbose: bool,
    pub rate_limit: Option<RateLimitConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub enable_parallel_execution: bool,
    pub max_parallel_tasks: usize,
    pub enable_checkpoints: bool,
    pub state_dir: PathBuf,
    pub run_id: Option<String>,
    pub typecheck_command: Option<String>,
}

impl OrchestratorConfig {
    /// Config with defaults for a project root
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        Self {
            state_dir: project_root.join(".taskloop"),
            project_root,
            prd_path: None,
            model: None,
            backend: BackendKind::default(),
            llm: LlmConfig::default(),
            max_attempts: 3,
            max_cost_usd: None,
            max_tokens: None,
            validation_steps: Vec::new(),
            fail_fast_validation: true,
            continue_on_failure: false,
            enable_context: false,
            enable_memory: true,
            enable_git_auto_commit: false,
            quality_gate: None,
            dry_run: false,
            verbose: false,
            rate_limit: None,
            circuit_breaker: None,
            enable_parallel_execution: false,
            max_parallel_tasks: 3,
            enable_checkpoints: false,
            run_id: None,
            typecheck_command: None,
        }
    }
}
