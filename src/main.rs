//! Taskloop - PRD-driven autonomous task orchestrator
//!
//! CLI entry point. Diagnostics go to stderr via tracing; stdout carries
//! only the final JSON summary.

use clap::Parser;
use eyre::{Context, Result};

use taskloop::cli::{Cli, Command};
use taskloop::config::{Config, OrchestratorConfig};
use taskloop::orchestrator::Orchestrator;
use taskloop::prd::Prd;
use taskloop::state::RunStatus;

fn setup_logging(verbose: bool) {
    let default_level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Validate { prd } => {
            let prd = Prd::load(&prd)?;
            println!(
                "{}",
                serde_json::json!({"project": prd.project, "tasks": prd.tasks.len(), "valid": true})
            );
            Ok(())
        }
        Command::Run {
            prd,
            project_root,
            model,
            backend,
            max_attempts,
            max_cost_usd,
            continue_on_failure,
            parallel,
            max_parallel_tasks,
            checkpoints,
            run_id,
            dry_run,
        } => {
            let mut orch_config = OrchestratorConfig::new(&project_root);
            orch_config.prd_path = Some(prd);
            orch_config.model = model;
            orch_config.backend = backend.into();
            orch_config.llm = config.llm.clone();
            orch_config.max_attempts = max_attempts;
            orch_config.max_cost_usd = max_cost_usd;
            orch_config.continue_on_failure = continue_on_failure;
            orch_config.enable_parallel_execution = parallel;
            orch_config.max_parallel_tasks = max_parallel_tasks;
            orch_config.enable_checkpoints = checkpoints;
            orch_config.run_id = run_id;
            orch_config.dry_run = dry_run;
            orch_config.verbose = cli.verbose;
            orch_config.validation_steps = config.validation_steps.clone();
            orch_config.typecheck_command = config.typecheck_command.clone();
            if let Some(dir) = &config.state_dir {
                orch_config.state_dir = dir.clone();
            }

            let mut orchestrator = Orchestrator::new(orch_config)?;
            let summary = orchestrator.run().await?;

            println!("{}", serde_json::to_string_pretty(&summary)?);

            match summary.status {
                RunStatus::Completed if summary.failed.is_empty() => Ok(()),
                RunStatus::Cancelled => std::process::exit(130),
                _ => std::process::exit(1),
            }
        }
    }
}
