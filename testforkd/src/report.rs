//! Run report: the aggregate result handed back to the build driver.

use crate::pipeline::PipelineSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::io::Write;
use std::path::Path;
use testfork_common::{ClassOutcome, PipelineState};
use uuid::Uuid;

/// Why the driver stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every pipeline completed.
    Complete,
    /// The completion timeout fired first.
    TimedOut,
    /// Every fork process exited before all pipelines completed.
    ForksExited,
    /// Interrupted by the user.
    Interrupted,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::ForksExited => write!(f, "forks_exited"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub classes: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    /// Classes left pending or in flight.
    pub unfinished: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: RunOutcome,
    pub totals: RunTotals,
    pub pipelines: Vec<PipelineSnapshot>,
}

impl RunReport {
    pub fn new(
        started_at: DateTime<Utc>,
        outcome: RunOutcome,
        pipelines: Vec<PipelineSnapshot>,
    ) -> Self {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

        let mut totals = RunTotals::default();
        for p in &pipelines {
            totals.classes += p.total_classes();
            totals.passed += p.count(ClassOutcome::Pass);
            totals.failed += p.count(ClassOutcome::Fail);
            totals.errored += p.count(ClassOutcome::Error);
            totals.unfinished += p.pending.len() + p.in_flight.len();
        }

        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at,
            duration_ms,
            outcome,
            totals,
            pipelines,
        }
    }

    /// All pipelines completed and every class passed.
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Complete
            && self.totals.failed == 0
            && self.totals.errored == 0
            && self.totals.unfinished == 0
            && self.pipelines.iter().all(|p| p.state == PipelineState::Complete)
    }

    /// Plain-text summary for the terminal.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "testfork run {} ({}, {} ms)",
            self.run_id, self.outcome, self.duration_ms
        );
        for p in &self.pipelines {
            let _ = writeln!(
                out,
                "  pipeline {}: {} - {} passed, {} failed, {} errored, {} unfinished",
                p.id,
                state_label(p.state),
                p.count(ClassOutcome::Pass),
                p.count(ClassOutcome::Fail),
                p.count(ClassOutcome::Error),
                p.pending.len() + p.in_flight.len()
            );
            for (class, outcome) in &p.results {
                if !outcome.is_success() {
                    let _ = writeln!(out, "    {outcome}: {class}");
                }
            }
            for (class, fork) in &p.in_flight {
                let _ = writeln!(out, "    unfinished: {class} (fork {fork})");
            }
        }
        let t = &self.totals;
        let _ = write!(
            out,
            "{} classes: {} passed, {} failed, {} errored, {} unfinished",
            t.classes, t.passed, t.failed, t.errored, t.unfinished
        );
        out
    }

    /// Write the report as pretty JSON, replacing `path` atomically.
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&temp_path)?;
            serde_json::to_writer_pretty(&mut file, self)?;
            file.write_all(b"\n")?;
        }
        std::fs::rename(temp_path, path)
    }
}

fn state_label(state: PipelineState) -> &'static str {
    match state {
        PipelineState::NotStarted => "not started",
        PipelineState::Running => "running",
        PipelineState::Draining => "draining",
        PipelineState::Complete => "complete",
    }
}
