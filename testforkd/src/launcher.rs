//! Spawning fork processes.
//!
//! A fork is started with exactly three arguments (`pipeline_id fork_id
//! server_port`); everything else it needs travels in `TESTFORK_*`
//! environment variables.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use testfork_common::{ForkConfig, ForkId, PipelineId};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Name of the fork executor binary.
pub const WORKER_BIN: &str = "testfork-wkr";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("cannot find testfork-wkr; pass --worker-bin or put it on PATH")]
    WorkerNotFound,

    #[error("failed to spawn fork {fork} of pipeline {pipeline} from {}: {source}", .program.display())]
    Spawn {
        pipeline: PipelineId,
        fork: ForkId,
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Locate the fork binary: next to the current executable, then on PATH.
pub fn find_worker_bin() -> Result<PathBuf, LaunchError> {
    if let Ok(exe_path) = std::env::current_exe()
        && let Some(dir) = exe_path.parent()
    {
        let candidate = dir.join(WORKER_BIN);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    which::which(WORKER_BIN).map_err(|_| LaunchError::WorkerNotFound)
}

/// A running fork process.
#[derive(Debug)]
pub struct ForkProcess {
    pub pipeline: PipelineId,
    pub fork: ForkId,
    child: Child,
}

impl ForkProcess {
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Wait up to `grace`, then kill.
    pub async fn reap(&mut self, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!(
                "Fork {} of pipeline {} exited: {}",
                self.fork, self.pipeline, status
            ),
            Ok(Err(e)) => warn!("Failed to wait for fork {}: {}", self.fork, e),
            Err(_) => {
                warn!(
                    "Fork {} of pipeline {} still running after {:?}; killing",
                    self.fork, self.pipeline, grace
                );
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill fork {}: {}", self.fork, e);
                }
            }
        }
    }
}

pub struct ForkLauncher {
    program: PathBuf,
    server_port: u16,
    config: ForkConfig,
    verbose: bool,
}

impl ForkLauncher {
    pub fn new(program: impl Into<PathBuf>, server_port: u16, config: ForkConfig) -> Self {
        Self {
            program: program.into(),
            server_port,
            config,
            verbose: false,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments passed to a fork.
    pub fn args(&self, pipeline: PipelineId, fork: ForkId) -> Vec<String> {
        let mut args = vec![
            pipeline.to_string(),
            fork.to_string(),
            self.server_port.to_string(),
        ];
        if self.verbose {
            args.push("--verbose".to_string());
        }
        args
    }

    pub fn spawn(&self, pipeline: PipelineId, fork: ForkId) -> Result<ForkProcess, LaunchError> {
        let child = Command::new(&self.program)
            .args(self.args(pipeline, fork))
            .envs(self.config.to_env_vars())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                pipeline,
                fork,
                program: self.program.clone(),
                source,
            })?;

        info!(
            "Spawned fork {} of pipeline {} (pid {})",
            fork,
            pipeline,
            child.id().map_or_else(|| "?".to_string(), |p| p.to_string())
        );
        Ok(ForkProcess {
            pipeline,
            fork,
            child,
        })
    }
}
