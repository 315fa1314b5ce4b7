//! Logging setup shared by `testforkd` and `testfork-wkr`.
//!
//! Both binaries call [`init_logging`] once from `main` and keep the returned
//! [`LoggingGuards`] alive until exit so buffered file output is flushed.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive (a level, or a full `EnvFilter` expression).
    pub level: String,
    pub format: LogFormat,
    /// Write to stderr. Forks keep stdout free for the test command.
    pub stderr: bool,
    /// Optional file that receives JSON lines in addition to the console.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            stderr: false,
            file: None,
        }
    }
}

impl LogConfig {
    /// Build from `TESTFORK_LOG`, `TESTFORK_LOG_FORMAT` and
    /// `TESTFORK_LOG_FILE`, falling back to `default_level`.
    pub fn from_env(default_level: &str) -> Self {
        let level = std::env::var("TESTFORK_LOG")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_level.to_string());
        let format = std::env::var("TESTFORK_LOG_FORMAT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        let file = std::env::var("TESTFORK_LOG_FILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Self {
            level,
            format,
            stderr: false,
            file,
        }
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Keeps non-blocking writers alive; drop at process exit.
#[derive(Default)]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> std::io::Result<LoggingGuards> {
    let console = match config.format {
        LogFormat::Pretty => {
            let layer = fmt::layer().with_target(true).with_thread_names(true);
            if config.stderr {
                layer.with_writer(std::io::stderr).boxed()
            } else {
                layer.boxed()
            }
        }
        LogFormat::Json => {
            let layer = fmt::layer().json().with_current_span(true);
            if config.stderr {
                layer.with_writer(std::io::stderr).boxed()
            } else {
                layer.boxed()
            }
        }
    };

    let mut guards = LoggingGuards::default();
    let file_layer = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            guards._file = Some(guard);
            Some(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_thread_ids(true)
                    .with_current_span(true),
            )
        }
        None => None,
    };

    let _ = tracing_subscriber::registry()
        .with(config.filter())
        .with(console)
        .with(file_layer)
        .try_init();

    Ok(guards)
}
