//! CLI command definitions

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::BackendKind;

/// Taskloop - PRD-driven autonomous task orchestrator
#[derive(Parser)]
#[command(
    name = "taskloop",
    about = "Drives an LLM through a PRD of software-engineering tasks",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Backend selection on the command line
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum BackendArg {
    Api,
    #[default]
    Cli,
    Proxy,
}

impl From<BackendArg> for BackendKind {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Api => BackendKind::Api,
            BackendArg::Cli => BackendKind::Cli,
            BackendArg::Proxy => BackendKind::Proxy,
        }
    }
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Run a PRD to completion
    Run {
        /// Path to the PRD JSON file
        #[arg(value_name = "PRD")]
        prd: PathBuf,

        /// Project root the tasks operate on
        #[arg(short, long, default_value = ".")]
        project_root: PathBuf,

        /// Model preference (disables rule-based routing)
        #[arg(short, long)]
        model: Option<String>,

        /// LLM backend
        #[arg(short, long, default_value = "cli")]
        backend: BackendArg,

        /// Max attempts per task
        #[arg(long, default_value = "3")]
        max_attempts: u32,

        /// Budget cap in USD
        #[arg(long)]
        max_cost_usd: Option<f64>,

        /// Keep going after task failures
        #[arg(long)]
        continue_on_failure: bool,

        /// Run dependency levels concurrently
        #[arg(long)]
        parallel: bool,

        /// Max concurrent tasks per level
        #[arg(long, default_value = "3")]
        max_parallel_tasks: usize,

        /// Persist checkpoints and resume from them
        #[arg(long)]
        checkpoints: bool,

        /// Run id for checkpoint keying (defaults to a fresh uuid)
        #[arg(long)]
        run_id: Option<String>,

        /// Route and classify without calling any provider
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate a PRD without running anything
    Validate {
        /// Path to the PRD JSON file
        #[arg(value_name = "PRD")]
        prd: PathBuf,
    },
}
