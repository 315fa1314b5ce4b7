//! testfork control server
//!
//! Splits test classes into pipelines, spawns fork processes that connect
//! back over TCP, feeds them classes until every pipeline is drained, then
//! reports the results.

#![forbid(unsafe_code)]

mod dispatcher;
mod events;
mod handlers;
mod launcher;
mod pipeline;
mod report;
mod server;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use dispatcher::{PipelineDispatcher, PipelineRegistry};
use events::EventBus;
use launcher::{ForkLauncher, ForkProcess};
use pipeline::Pipeline;
use report::{RunOutcome, RunReport};
use server::ControlServer;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use testfork_common::{ForkId, LogConfig, PipelineId, TestForkConfig, init_logging};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// How long sessions get to settle after every fork process has exited.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// How long a fork gets to exit on its own before it is killed.
const REAP_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "testforkd")]
#[command(author, version, about = "testfork control server - runs test classes across forked workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (TOML)
    #[arg(short, long, global = true, env = "TESTFORK_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run test classes across forks
    Run(RunArgs),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args)]
struct RunArgs {
    /// Test class to run (repeatable)
    #[arg(long = "class", value_name = "NAME")]
    classes: Vec<String>,

    /// File with one test class per line ('#' starts a comment)
    #[arg(long, value_name = "PATH")]
    classes_file: Option<PathBuf>,

    /// Number of pipelines to split classes across
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pipelines: u32,

    /// Forks per pipeline
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    forks: u32,

    /// Fork executor binary (default: next to testforkd, then PATH)
    #[arg(long, value_name = "PATH")]
    worker_bin: Option<PathBuf>,

    /// Control server port (0 picks a free port)
    #[arg(long)]
    port: Option<u16>,

    /// Give up and kill forks after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Write a JSON report to this path
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Print lifecycle events as JSON lines on stdout
    #[arg(long)]
    events: bool,
}

/// Shared server state for one run.
pub struct ServerContext {
    pub config: TestForkConfig,
    pub events: EventBus,
    pub registry: Arc<PipelineRegistry>,
}

// Returning the exit code keeps the logging guards alive until the file
// writer has flushed.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = TestForkConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // Stdout carries the summary and events; logs go to stderr.
    let mut log_config = LogConfig::from_env(&config.general.log_level).with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    match cli.command {
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run(args) => {
            if run(args, config, cli.verbose).await? {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

async fn run(args: RunArgs, mut config: TestForkConfig, verbose: bool) -> Result<bool> {
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(secs) = args.timeout_secs {
        config.server.completion_timeout_secs = secs;
    }
    config.validate()?;

    let classes = collect_classes(&args.classes, args.classes_file.as_deref())?;
    if classes.is_empty() {
        warn!("No test classes given; forks will stop immediately");
    }
    let worker_bin = match args.worker_bin {
        Some(path) => path,
        None => launcher::find_worker_bin()?,
    };

    let events = EventBus::default();
    let mut registry = PipelineRegistry::new();
    for (idx, lane) in split_round_robin(classes, args.pipelines).into_iter().enumerate() {
        info!("Pipeline {}: {} classes", idx, lane.len());
        registry.insert(PipelineDispatcher::new(
            Pipeline::new(PipelineId::new(idx as u32), lane),
            events.clone(),
            config.server.reclaim,
        ));
    }
    let context = ServerContext {
        config,
        events,
        registry: Arc::new(registry),
    };
    if args.events {
        spawn_event_printer(&context.events);
    }

    let server = ControlServer::bind(
        (context.config.server.host.as_str(), context.config.server.port),
        Arc::clone(&context.registry),
    )
    .await
    .with_context(|| {
        format!(
            "Failed to bind control server on {}:{}",
            context.config.server.host, context.config.server.port
        )
    })?;
    let addr = server.local_addr()?;
    let server_task = server.spawn();

    let started_at = Utc::now();
    let launcher = ForkLauncher::new(worker_bin, addr.port(), context.config.fork.clone())
        .with_verbose(verbose);
    info!(
        "Launching {} forks per pipeline from {}",
        args.forks,
        launcher.program().display()
    );
    let mut forks = Vec::new();
    for dispatcher in context.registry.dispatchers() {
        for fork in 0..args.forks {
            forks.push(launcher.spawn(dispatcher.id(), ForkId::new(fork))?);
        }
    }

    let outcome = supervise(&context, &mut forks).await;
    if outcome != RunOutcome::Complete {
        let asked = context.registry.stop_all();
        warn!("Run ended {}; asked {} live forks to stop", outcome, asked);
    }
    for fork in &mut forks {
        fork.reap(REAP_GRACE).await;
    }
    server_task.abort();

    let report = RunReport::new(started_at, outcome, context.registry.snapshots());
    println!("{}", report.summary());
    if let Some(path) = &args.report {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!("Report written to {}", path.display());
    }
    Ok(report.is_success())
}

/// Wait for completion, bounded by the watchdog timeout.
async fn supervise(context: &ServerContext, forks: &mut [ForkProcess]) -> RunOutcome {
    let timeout = context.config.server.completion_timeout();
    tokio::select! {
        _ = context.registry.wait_all() => RunOutcome::Complete,
        _ = wait_forks(forks) => {
            match tokio::time::timeout(EXIT_GRACE, context.registry.wait_all()).await {
                Ok(_) => RunOutcome::Complete,
                Err(_) => RunOutcome::ForksExited,
            }
        }
        _ = tokio::time::sleep(timeout) => {
            warn!("Pipelines not complete after {:?}", timeout);
            RunOutcome::TimedOut
        }
        _ = tokio::signal::ctrl_c() => RunOutcome::Interrupted,
    }
}

async fn wait_forks(forks: &mut [ForkProcess]) {
    for fork in forks.iter_mut() {
        match fork.wait().await {
            Ok(status) if status.success() => {
                debug!("Fork {} of pipeline {} exited", fork.fork, fork.pipeline)
            }
            Ok(status) => warn!(
                "Fork {} of pipeline {} exited with {}",
                fork.fork, fork.pipeline, status
            ),
            Err(e) => warn!("Failed to wait for fork {}: {}", fork.fork, e),
        }
    }
}

fn spawn_event_printer(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(line) => println!("{line}"),
                Err(RecvError::Lagged(skipped)) => warn!("Event printer skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Classes from `--class` flags followed by the classes file, if any.
fn collect_classes(flags: &[String], file: Option<&Path>) -> Result<Vec<String>> {
    let mut classes: Vec<String> = flags
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();

    if let Some(path) = file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read classes file {}", path.display()))?;
        classes.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }
    Ok(classes)
}

/// Deal classes into `lanes` pipelines round-robin.
fn split_round_robin(classes: Vec<String>, lanes: u32) -> Vec<Vec<String>> {
    let lanes = lanes.max(1) as usize;
    let mut out = vec![Vec::new(); lanes];
    for (idx, class) in classes.into_iter().enumerate() {
        out[idx % lanes].push(class);
    }
    out
}
