//! `TESTFORK_*` environment overrides.
//!
//! Every getter falls back to the caller's default when the variable is
//! unset or malformed. Malformed values are collected rather than returned
//! so one pass reports every bad variable.

use super::source::Sourced;
use std::env;
use std::time::Duration;
use thiserror::Error;

const PREFIX: &str = "TESTFORK_";

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("{var}='{value}' is not {expected}")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("{var}='{value}' is not a duration (try 250ms, 5s or 2m)")]
    InvalidDuration { var: String, value: String },

    #[error("{var}='{value}' is shorter than the minimum of {min}")]
    DurationTooShort {
        var: String,
        value: String,
        min: String,
    },

    #[error("{var}={value} is outside {min}..={max}")]
    OutOfRange {
        var: String,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("{var}='{value}' is not a log level (one of {})", LOG_LEVELS.join(", "))]
    InvalidLogLevel { var: String, value: String },
}

#[derive(Debug, Default)]
pub struct EnvParser {
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// `(full variable name, raw value)` when the variable is set.
    fn lookup(name: &str) -> Option<(String, String)> {
        let var = format!("{PREFIX}{name}");
        env::var(&var).ok().map(|value| (var, value))
    }

    /// Record `error` and fall back to `default`.
    fn reject<T>(&mut self, error: EnvError, default: T) -> Sourced<T> {
        self.errors.push(error);
        Sourced::default_value(default)
    }

    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        match Self::lookup(name) {
            Some((var, value)) => Sourced::from_env(value, var),
            None => Sourced::default_value(default.to_string()),
        }
    }

    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> Sourced<u64> {
        let Some((var, value)) = Self::lookup(name) else {
            return Sourced::default_value(default);
        };
        match value.trim().parse::<u64>() {
            Ok(n) if (min..=max).contains(&n) => Sourced::from_env(n, var),
            Ok(n) => self.reject(
                EnvError::OutOfRange {
                    var,
                    value: n,
                    min,
                    max,
                },
                default,
            ),
            Err(_) => self.reject(
                EnvError::InvalidValue {
                    var,
                    expected: "a non-negative integer".to_string(),
                    value,
                },
                default,
            ),
        }
    }

    /// Humantime syntax (`100ms`, `5s`, `2m`); a bare integer means milliseconds.
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        let Some((var, value)) = Self::lookup(name) else {
            return Sourced::default_value(default);
        };
        let trimmed = value.trim();
        let parsed = trimmed
            .parse::<u64>()
            .map(Duration::from_millis)
            .or_else(|_| humantime::parse_duration(trimmed));
        match parsed {
            Ok(duration) => Sourced::from_env(duration, var),
            Err(_) => self.reject(EnvError::InvalidDuration { var, value }, default),
        }
    }

    /// Like `get_duration`, but values below `min` are rejected.
    pub fn get_duration_at_least(
        &mut self,
        name: &str,
        default: Duration,
        min: Duration,
    ) -> Sourced<Duration> {
        let parsed = self.get_duration(name, default);
        if parsed.value >= min || !parsed.is_from_env() {
            return parsed;
        }
        let var = parsed.var.unwrap_or_else(|| format!("{PREFIX}{name}"));
        let value = humantime::format_duration(parsed.value).to_string();
        let min = humantime::format_duration(min).to_string();
        self.reject(EnvError::DurationTooShort { var, value, min }, default)
    }

    /// Level names are case-insensitive and stored lowercase.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let Some((var, value)) = Self::lookup(name) else {
            return Sourced::default_value(default.to_string());
        };
        let level = value.trim().to_ascii_lowercase();
        if LOG_LEVELS.contains(&level.as_str()) {
            Sourced::from_env(level, var)
        } else {
            self.reject(EnvError::InvalidLogLevel { var, value }, default.to_string())
        }
    }

    /// Any `FromStr` value; `expected` describes valid input in the error.
    pub fn get_parsed<T: std::str::FromStr>(
        &mut self,
        name: &str,
        default: T,
        expected: &str,
    ) -> Sourced<T> {
        let Some((var, value)) = Self::lookup(name) else {
            return Sourced::default_value(default);
        };
        match value.trim().parse::<T>() {
            Ok(parsed) => Sourced::from_env(parsed, var),
            Err(_) => self.reject(
                EnvError::InvalidValue {
                    var,
                    expected: expected.to_string(),
                    value,
                },
                default,
            ),
        }
    }
}
