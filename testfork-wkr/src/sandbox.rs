//! Sandbox that runs one test class at a time.
//!
//! Each class runs in its own child process, so nothing a test leaves behind
//! in memory survives into the next class.

use std::collections::HashMap;
use std::process::{Command, ExitStatus, Stdio};
use testfork_common::ClassOutcome;
use thiserror::Error;
use tracing::{debug, warn};

/// Placeholder replaced by the class name in a command template.
pub const CLASS_PLACEHOLDER: &str = "{class}";

/// Environment variable carrying the class name into the child.
pub const CLASS_ENV_VAR: &str = "TESTFORK_CLASS";

/// Pipeline and fork ids exported to every class run by this fork.
pub const PIPELINE_ENV_VAR: &str = "TESTFORK_PIPELINE_ID";
pub const FORK_ENV_VAR: &str = "TESTFORK_FORK_ID";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("test command template is empty")]
    EmptyTemplate,

    #[error("cannot parse test command template '{0}'")]
    BadTemplate(String),
}

/// Executes test classes and reports their outcome.
pub trait TestRunner: Send {
    fn run_class(&mut self, class_name: &str) -> ClassOutcome;
}

/// Runs each class as `program args...` built from a shell-style template.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl CommandRunner {
    pub fn from_template(template: &str) -> Result<Self, SandboxError> {
        let mut words = shlex::split(template)
            .ok_or_else(|| SandboxError::BadTemplate(template.to_string()))?
            .into_iter();
        let program = words.next().ok_or(SandboxError::EmptyTemplate)?;
        Ok(Self {
            program,
            args: words.collect(),
            env: HashMap::new(),
        })
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Program and arguments for `class_name`.
    ///
    /// Every `{class}` occurrence is substituted; without one the class is
    /// appended as the last argument.
    pub fn command_line(&self, class_name: &str) -> (String, Vec<String>) {
        let has_placeholder = self.program.contains(CLASS_PLACEHOLDER)
            || self.args.iter().any(|a| a.contains(CLASS_PLACEHOLDER));
        let program = self.program.replace(CLASS_PLACEHOLDER, class_name);
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(CLASS_PLACEHOLDER, class_name))
            .collect();
        if !has_placeholder {
            args.push(class_name.to_string());
        }
        (program, args)
    }

    fn spawn_and_wait(&self, class_name: &str) -> std::io::Result<ExitStatus> {
        let (program, args) = self.command_line(class_name);
        debug!("Running {} {:?}", program, args);
        Command::new(&program)
            .args(&args)
            .envs(&self.env)
            .env(CLASS_ENV_VAR, class_name)
            .stdin(Stdio::null())
            .status()
    }
}

impl TestRunner for CommandRunner {
    fn run_class(&mut self, class_name: &str) -> ClassOutcome {
        match self.spawn_and_wait(class_name) {
            Ok(status) if status.success() => ClassOutcome::Pass,
            Ok(status) => match status.code() {
                Some(code) => {
                    debug!("Class {} exited with code {}", class_name, code);
                    ClassOutcome::Fail
                }
                None => {
                    warn!("Class {} terminated by signal ({})", class_name, status);
                    ClassOutcome::Error
                }
            },
            Err(e) => {
                warn!("Failed to launch test command for {}: {}", class_name, e);
                ClassOutcome::Error
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_substitution() {
        let runner = CommandRunner::from_template("cargo test --test {class} -- --nocapture").unwrap();
        let (program, args) = runner.command_line("integration_a");
        assert_eq!(program, "cargo");
        assert_eq!(args, vec!["test", "--test", "integration_a", "--", "--nocapture"]);
    }

    #[test]
    fn test_class_appended_without_placeholder() {
        let runner = CommandRunner::from_template("run-suite --fast").unwrap();
        let (_, args) = runner.command_line("SuiteA");
        assert_eq!(args, vec!["--fast", "SuiteA"]);
    }

    #[test]
    fn test_quoted_template_words() {
        let runner = CommandRunner::from_template(r#"sh -c "echo '{class}'""#).unwrap();
        let (program, args) = runner.command_line("X");
        assert_eq!(program, "sh");
        assert_eq!(args, vec!["-c", "echo 'X'"]);
    }

    #[test]
    fn test_bad_templates_rejected() {
        assert!(matches!(
            CommandRunner::from_template("   "),
            Err(SandboxError::EmptyTemplate)
        ));
        assert!(matches!(
            CommandRunner::from_template("sh -c \"unterminated"),
            Err(SandboxError::BadTemplate(_))
        ));
    }

    #[test]
    fn test_missing_program_is_error_outcome() {
        let mut runner = CommandRunner::from_template("/nonexistent/testfork-runner {class}").unwrap();
        assert_eq!(runner.run_class("A"), ClassOutcome::Error);
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_status_maps_to_outcome() {
        let mut runner = CommandRunner::from_template(
            r#"sh -c "case $TESTFORK_CLASS in pass*) exit 0;; *) exit 3;; esac""#,
        )
        .unwrap();
        assert_eq!(runner.run_class("pass_one"), ClassOutcome::Pass);
        assert_eq!(runner.run_class("fail_one"), ClassOutcome::Fail);
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_death_is_error() {
        let mut runner = CommandRunner::from_template(r#"sh -c "kill -9 $$""#).unwrap();
        assert_eq!(runner.run_class("A"), ClassOutcome::Error);
    }

    #[cfg(unix)]
    #[test]
    fn test_each_class_gets_its_own_process() {
        let dir = tempfile::tempdir().unwrap();
        let template = format!(
            r#"sh -c "echo $$ > '{}'/$TESTFORK_CLASS.pid""#,
            dir.path().display()
        );
        let mut runner = CommandRunner::from_template(&template).unwrap();
        assert_eq!(runner.run_class("A"), ClassOutcome::Pass);
        assert_eq!(runner.run_class("B"), ClassOutcome::Pass);

        let pid_a = std::fs::read_to_string(dir.path().join("A.pid")).unwrap();
        let pid_b = std::fs::read_to_string(dir.path().join("B.pid")).unwrap();
        assert_ne!(pid_a.trim(), pid_b.trim());
        assert_ne!(pid_a.trim(), std::process::id().to_string());
    }

    #[cfg(unix)]
    #[test]
    fn test_extra_env_reaches_child() {
        let mut runner = CommandRunner::from_template(r#"sh -c "test \"$SUITE_MODE\" = strict""#)
            .unwrap()
            .with_env("SUITE_MODE", "strict");
        assert_eq!(runner.run_class("A"), ClassOutcome::Pass);
    }
}
