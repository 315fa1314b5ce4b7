//! Common types used across testfork components.

use serde::{Deserialize, Serialize};

/// Identifier of one parallel lane of test classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(pub u32);

impl PipelineId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a fork, unique within its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForkId(pub u32);

impl ForkId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ForkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of executing one test class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassOutcome {
    /// Every test in the class passed.
    Pass,
    /// At least one test failed an assertion.
    Fail,
    /// The class could not be run to completion.
    Error,
}

impl ClassOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Pass)
    }
}

impl std::fmt::Display for ClassOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Lifecycle of a fork, as seen by the fork itself and by its dispatcher.
///
/// Transitions only move forward; `Stopped` and `Crashed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkState {
    Connecting,
    Started,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl ForkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Any live state may crash; otherwise states advance strictly forward and
    /// `Stopped` is only reachable from a live state.
    pub fn can_transition_to(self, next: ForkState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Crashed => true,
            Self::Stopped => true,
            _ => next > self,
        }
    }
}

impl Default for ForkState {
    fn default() -> Self {
        Self::Connecting
    }
}

impl std::fmt::Display for ForkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Started => write!(f, "started"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

/// Lifecycle of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// No fork has announced itself yet.
    NotStarted,
    /// Forks are pulling work.
    Running,
    /// The backlog is empty; waiting for in-flight classes and forks.
    Draining,
    /// Backlog resolved and every fork terminal.
    Complete,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Complete => write!(f, "complete"),
        }
    }
}
