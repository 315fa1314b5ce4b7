//! Configuration system for testfork.
//!
//! Values are resolved in three layers: built-in defaults, an optional TOML
//! file, then `TESTFORK_*` environment variables. Forks only ever read the
//! environment layer, which the launcher passes through from the server.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default bound on inbound control messages buffered by a fork.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Default consumer poll timeout; bounds fork shutdown latency.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

/// Default test command; `{class}` is replaced by the class name.
pub const DEFAULT_TEST_COMMAND: &str = "cargo test --quiet --test {class}";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment configuration: {}", format_env_errors(.0))]
    Env(Vec<EnvError>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// What the server does with the in-flight class of a crashed fork.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimPolicy {
    /// Keep the class recorded as in-flight against the crashed fork. The
    /// pipeline cannot complete until the watchdog gives up.
    #[default]
    Leave,
    /// Put the class back at the head of the backlog for another fork.
    Requeue,
}

impl std::fmt::Display for ReclaimPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leave => write!(f, "leave"),
            Self::Requeue => write!(f, "requeue"),
        }
    }
}

impl std::str::FromStr for ReclaimPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "leave" => Ok(Self::Leave),
            "requeue" => Ok(Self::Requeue),
            other => Err(format!("unknown reclaim policy '{other}'")),
        }
    }
}

/// Top-level testfork configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestForkConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fork: ForkConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the control server binds and forks connect to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port; 0 picks an ephemeral port.
    #[serde(default)]
    pub port: u16,
    /// How long the driver waits for all pipelines before killing forks.
    #[serde(default = "default_completion_timeout")]
    pub completion_timeout_secs: u64,
    /// Policy for classes held by crashed forks.
    #[serde(default)]
    pub reclaim: ReclaimPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            completion_timeout_secs: default_completion_timeout(),
            reclaim: ReclaimPolicy::Leave,
        }
    }
}

impl ServerConfig {
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkConfig {
    /// Host the fork connects to.
    #[serde(default = "default_host")]
    pub server_host: String,
    /// Bound on buffered inbound control messages.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Consumer poll timeout (ms).
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
    /// Connect timeout (ms).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Command template used to run one test class.
    #[serde(default = "default_test_command")]
    pub test_command: String,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            server_host: default_host(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            connect_timeout_ms: default_connect_timeout(),
            test_command: default_test_command(),
        }
    }
}

impl ForkConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Fork-side configuration comes from the environment only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let mut parser = EnvParser::new();
        config.apply_env(&mut parser);
        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }
        config.validate()?;
        debug!(
            "Fork configuration: server host {}, queue capacity {}, poll {:?}",
            config.server_host,
            config.queue_capacity,
            config.poll_timeout()
        );
        Ok(config)
    }

    fn apply_env(&mut self, parser: &mut EnvParser) {
        parser
            .get_string("SERVER_HOST", &self.server_host)
            .apply_to(&mut self.server_host);

        let capacity = parser.get_u64_range("QUEUE_CAPACITY", self.queue_capacity as u64, 1, 4096);
        if capacity.is_from_env() {
            self.queue_capacity = capacity.value as usize;
        }

        let poll = parser.get_duration("POLL_TIMEOUT", self.poll_timeout());
        if poll.is_from_env() {
            self.poll_timeout_ms = poll.value.as_millis() as u64;
        }

        let connect = parser.get_duration("CONNECT_TIMEOUT", self.connect_timeout());
        if connect.is_from_env() {
            self.connect_timeout_ms = connect.value.as_millis() as u64;
        }

        parser
            .get_string("TEST_COMMAND", &self.test_command)
            .apply_to(&mut self.test_command);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "fork.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "fork.poll_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.test_command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "fork.test_command must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Environment variables a launcher must set so a fork sees this config.
    pub fn to_env_vars(&self) -> Vec<(String, String)> {
        vec![
            ("TESTFORK_SERVER_HOST".to_string(), self.server_host.clone()),
            (
                "TESTFORK_QUEUE_CAPACITY".to_string(),
                self.queue_capacity.to_string(),
            ),
            (
                "TESTFORK_POLL_TIMEOUT".to_string(),
                self.poll_timeout_ms.to_string(),
            ),
            (
                "TESTFORK_CONNECT_TIMEOUT".to_string(),
                self.connect_timeout_ms.to_string(),
            ),
            ("TESTFORK_TEST_COMMAND".to_string(), self.test_command.clone()),
        ]
    }
}

impl TestForkConfig {
    /// Load defaults, then `path` (if any), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                debug!("Loading configuration from {}", path.display());
                Self::from_file(path)?
            }
            None => Self::default(),
        };

        let mut parser = EnvParser::new();
        config.apply_env(&mut parser);
        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }

        config.validate()?;
        debug!(
            "Configuration: server {}:{}, reclaim {}, queue capacity {}",
            config.server.host, config.server.port, config.server.reclaim, config.fork.queue_capacity
        );
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self, parser: &mut EnvParser) {
        parser
            .get_log_level("LOG_LEVEL", &self.general.log_level)
            .apply_to(&mut self.general.log_level);

        parser
            .get_string("SERVER_HOST", &self.server.host)
            .apply_to(&mut self.server.host);

        let port = parser.get_u64_range("PORT", u64::from(self.server.port), 0, u64::from(u16::MAX));
        if port.is_from_env() {
            self.server.port = port.value as u16;
        }

        let timeout = parser.get_duration_at_least(
            "COMPLETION_TIMEOUT",
            self.server.completion_timeout(),
            Duration::from_secs(1),
        );
        if timeout.is_from_env() {
            // Whole seconds, rounded up.
            let value = timeout.value;
            self.server.completion_timeout_secs =
                value.as_secs() + u64::from(value.subsec_nanos() > 0);
        }

        parser
            .get_parsed("RECLAIM", self.server.reclaim, "leave or requeue")
            .apply_to(&mut self.server.reclaim);

        self.fork.apply_env(parser);
        // Forks dial whatever host the server binds.
        self.fork.server_host = self.server.host.clone();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.completion_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "server.completion_timeout_secs must be at least 1".to_string(),
            ));
        }
        self.fork.validate()
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_completion_timeout() -> u64 {
    3600
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_poll_timeout() -> u64 {
    DEFAULT_POLL_TIMEOUT_MS
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_test_command() -> String {
    DEFAULT_TEST_COMMAND.to_string()
}
