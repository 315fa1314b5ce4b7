//! testfork fork executor
//!
//! Spawned by `testforkd` once per fork. Connects back to the control server,
//! pulls test classes one at a time and runs each in its own child process.

#![forbid(unsafe_code)]

mod connector;
mod context;
mod dispatcher;
mod executor;
mod queue;
mod sandbox;

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use context::ForkContext;
use executor::ForkExecutor;
use sandbox::{CommandRunner, FORK_ENV_VAR, PIPELINE_ENV_VAR};
use testfork_common::{ForkConfig, ForkId, LogConfig, PipelineId, init_logging};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "testfork-wkr")]
#[command(author, version, about = "testfork fork executor - runs test classes for the control server")]
struct Cli {
    /// Pipeline this fork belongs to
    pipeline_id: u32,

    /// Fork id, unique within the pipeline
    fork_id: u32,

    /// Control server port to connect to
    server_port: u16,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

// Returning the exit code keeps the logging guards alive until the file
// writer has flushed.
fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Stdout belongs to the test command; logs go to stderr.
    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    let config = ForkConfig::from_env().context("Failed to load fork configuration")?;
    let runner = CommandRunner::from_template(&config.test_command)
        .context("Failed to prepare test command")?
        .with_env(PIPELINE_ENV_VAR, cli.pipeline_id.to_string())
        .with_env(FORK_ENV_VAR, cli.fork_id.to_string());

    let context = ForkContext::new(
        PipelineId::new(cli.pipeline_id),
        ForkId::new(cli.fork_id),
        cli.server_port,
        config,
    );
    info!(
        "Fork {} of pipeline {} starting (server port {})",
        context.fork_id, context.pipeline_id, context.server_port
    );

    let report = match ForkExecutor::new(context, runner).execute() {
        Ok(report) => report,
        Err(e) => {
            error!("Fork startup failed: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    if !report.is_clean() {
        error!(
            "Fork ended {} after {} classes: {}",
            report.final_state,
            report.classes_executed,
            report.crash.as_deref().unwrap_or("unknown cause")
        );
        return Ok(ExitCode::FAILURE);
    }

    if let Some(reason) = report.stop_reason {
        info!(
            "Fork finished ({}) after {} classes",
            reason, report.classes_executed
        );
    }
    Ok(ExitCode::SUCCESS)
}
