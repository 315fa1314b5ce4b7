//! Pipeline: one lane of test classes and the forks working it.
//!
//! A pipeline is plain data. Its dispatcher owns it behind a mutex and is the
//! only code that mutates it. Every class is in exactly one of pending,
//! in-flight or completed at any time, and a fork holds at most one
//! in-flight class.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use testfork_common::{ClassOutcome, ForkId, ForkState, PipelineId, PipelineState};
use thiserror::Error;
use tracing::warn;

// ── Operation Results ────────────────────────────────────────────────────

/// Result of asking for the next class on behalf of a fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// The head of the backlog, now in flight against the fork.
    Assigned(String),
    /// The backlog is empty.
    Exhausted,
    /// The fork still holds this class; nothing was assigned.
    AlreadyHolding(String),
    /// The fork is unknown, terminal, or already told there is no more work.
    ForkNotLive,
}

/// Result of recording a `ClassCompleted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    Recorded,
    /// The class already has an outcome; the report was ignored.
    Duplicate,
    /// The class was never handed out.
    NotInFlight,
    /// The class is in flight against a different fork.
    WrongFork { holder: ForkId },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("fork {0} is not registered")]
    UnknownFork(ForkId),

    #[error("fork {fork} cannot move from {from} to {to}")]
    Illegal {
        fork: ForkId,
        from: ForkState,
        to: ForkState,
    },
}

// ── Snapshot ─────────────────────────────────────────────────────────────

/// Serializable point-in-time view of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineSnapshot {
    pub id: PipelineId,
    pub state: PipelineState,
    pub pending: Vec<String>,
    pub in_flight: BTreeMap<String, ForkId>,
    pub results: BTreeMap<String, ClassOutcome>,
    pub forks: BTreeMap<ForkId, ForkState>,
}

impl PipelineSnapshot {
    pub fn total_classes(&self) -> usize {
        self.pending.len() + self.in_flight.len() + self.results.len()
    }

    pub fn count(&self, outcome: ClassOutcome) -> usize {
        self.results.values().filter(|o| **o == outcome).count()
    }

    /// Every class passed and the pipeline completed.
    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Complete && self.results.values().all(|o| o.is_success())
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Pipeline {
    id: PipelineId,
    state: PipelineState,
    pending: VecDeque<String>,
    in_flight: HashMap<String, ForkId>,
    completed: BTreeMap<String, ClassOutcome>,
    forks: BTreeMap<ForkId, ForkState>,
}

impl Pipeline {
    /// Create a pipeline over `classes`, in order. Repeated names are dropped.
    pub fn new<I, S>(id: PipelineId, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut pending = VecDeque::new();
        for class in classes {
            let class: String = class.into();
            if !seen.insert(class.clone()) {
                warn!("Pipeline {}: dropping repeated class {}", id, class);
                continue;
            }
            pending.push_back(class);
        }

        Self {
            id,
            state: PipelineState::NotStarted,
            pending,
            in_flight: HashMap::new(),
            completed: BTreeMap::new(),
            forks: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Head of the backlog without removing it. Never blocks.
    pub fn next_pending(&self) -> Option<&str> {
        self.pending.front().map(String::as_str)
    }

    /// Class currently held by `fork`.
    pub fn holding(&self, fork: ForkId) -> Option<&str> {
        self.in_flight
            .iter()
            .find(|(_, holder)| **holder == fork)
            .map(|(class, _)| class.as_str())
    }

    pub fn fork_state(&self, fork: ForkId) -> Option<ForkState> {
        self.forks.get(&fork).copied()
    }

    /// Forks that are not yet terminal.
    pub fn live_forks(&self) -> Vec<ForkId> {
        self.forks
            .iter()
            .filter(|(_, state)| !state.is_terminal())
            .map(|(fork, _)| *fork)
            .collect()
    }

    /// Pop the head of the backlog and record it in flight against `fork`.
    pub fn assign_next(&mut self, fork: ForkId) -> Assignment {
        match self.forks.get(&fork) {
            Some(ForkState::Stopping) if !self.pending.is_empty() => {
                return Assignment::ForkNotLive;
            }
            Some(state) if !state.is_terminal() => {}
            _ => return Assignment::ForkNotLive,
        }
        if let Some(held) = self.holding(fork) {
            return Assignment::AlreadyHolding(held.to_string());
        }
        match self.pending.pop_front() {
            Some(class) => {
                self.in_flight.insert(class.clone(), fork);
                Assignment::Assigned(class)
            }
            None => Assignment::Exhausted,
        }
    }

    /// Record `outcome` for `class`, reported by `fork`.
    ///
    /// Only [`CompletionStatus::Recorded`] changes the pipeline.
    pub fn record_completion(
        &mut self,
        fork: ForkId,
        class: &str,
        outcome: ClassOutcome,
    ) -> CompletionStatus {
        if self.completed.contains_key(class) {
            return CompletionStatus::Duplicate;
        }
        match self.in_flight.get(class) {
            None => CompletionStatus::NotInFlight,
            Some(holder) if *holder != fork => CompletionStatus::WrongFork { holder: *holder },
            Some(_) => {
                self.in_flight.remove(class);
                self.completed.insert(class.to_string(), outcome);
                CompletionStatus::Recorded
            }
        }
    }

    /// Start tracking `fork` in `Started`. Returns false if it was already known.
    pub fn register_fork(&mut self, fork: ForkId) -> bool {
        if self.forks.contains_key(&fork) {
            return false;
        }
        self.forks.insert(fork, ForkState::Started);
        if self.state == PipelineState::NotStarted {
            self.state = PipelineState::Running;
        }
        true
    }

    /// Move `fork` forward to `next`, returning its previous state.
    pub fn transition_fork(
        &mut self,
        fork: ForkId,
        next: ForkState,
    ) -> Result<ForkState, TransitionError> {
        let current = self
            .forks
            .get_mut(&fork)
            .ok_or(TransitionError::UnknownFork(fork))?;
        let from = *current;
        if from == next {
            return Ok(from);
        }
        if !from.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                fork,
                from,
                to: next,
            });
        }
        *current = next;
        Ok(from)
    }

    /// Put the class held by `fork` back at the head of the backlog.
    pub fn reclaim_in_flight(&mut self, fork: ForkId) -> Option<String> {
        let class = self.holding(fork)?.to_string();
        self.in_flight.remove(&class);
        self.pending.push_front(class.clone());
        if self.state == PipelineState::Draining {
            self.state = PipelineState::Running;
        }
        Some(class)
    }

    /// The backlog ran dry for some fork.
    pub fn mark_draining(&mut self) {
        if self.state == PipelineState::Running && self.pending.is_empty() {
            self.state = PipelineState::Draining;
        }
    }

    /// Backlog and in-flight are empty and every known fork is terminal.
    ///
    /// A pipeline no fork has joined is never complete.
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
            && self.in_flight.is_empty()
            && !self.forks.is_empty()
            && self.forks.values().all(|s| s.is_terminal())
    }

    /// Move to `Complete` if [`Self::is_complete`] holds. Returns true on the
    /// transition.
    pub fn try_complete(&mut self) -> bool {
        if self.state != PipelineState::Complete && self.is_complete() {
            self.state = PipelineState::Complete;
            return true;
        }
        false
    }

    pub fn results(&self) -> &BTreeMap<String, ClassOutcome> {
        &self.completed
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            id: self.id,
            state: self.state,
            pending: self.pending.iter().cloned().collect(),
            in_flight: self
                .in_flight
                .iter()
                .map(|(class, fork)| (class.clone(), *fork))
                .collect(),
            results: self.completed.clone(),
            forks: self.forks.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(classes: &[&str]) -> Pipeline {
        Pipeline::new(PipelineId::new(0), classes.iter().copied())
    }

    fn fork(id: u32) -> ForkId {
        ForkId::new(id)
    }

    #[test]
    fn test_next_pending_on_empty_returns_none() {
        let p = pipeline(&[]);
        assert_eq!(p.next_pending(), None);
    }

    #[test]
    fn test_assign_next_is_fifo() {
        let mut p = pipeline(&["A", "B", "C"]);
        p.register_fork(fork(1));
        assert_eq!(p.next_pending(), Some("A"));
        assert_eq!(p.assign_next(fork(1)), Assignment::Assigned("A".into()));
        assert_eq!(p.holding(fork(1)), Some("A"));
        assert_eq!(p.next_pending(), Some("B"));
    }

    #[test]
    fn test_assign_refused_while_holding() {
        let mut p = pipeline(&["A", "B"]);
        p.register_fork(fork(1));
        p.assign_next(fork(1));
        assert_eq!(
            p.assign_next(fork(1)),
            Assignment::AlreadyHolding("A".into())
        );
        assert_eq!(p.next_pending(), Some("B"));
    }

    #[test]
    fn test_assign_refused_for_unknown_or_terminal_fork() {
        let mut p = pipeline(&["A"]);
        assert_eq!(p.assign_next(fork(7)), Assignment::ForkNotLive);

        p.register_fork(fork(1));
        p.transition_fork(fork(1), ForkState::Crashed).unwrap();
        assert_eq!(p.assign_next(fork(1)), Assignment::ForkNotLive);
        assert_eq!(p.next_pending(), Some("A"));
    }

    #[test]
    fn test_exhausted_backlog() {
        let mut p = pipeline(&[]);
        p.register_fork(fork(1));
        assert_eq!(p.assign_next(fork(1)), Assignment::Exhausted);
    }

    #[test]
    fn test_duplicate_completion_is_idempotent() {
        let mut p = pipeline(&["A"]);
        p.register_fork(fork(1));
        p.assign_next(fork(1));

        assert_eq!(
            p.record_completion(fork(1), "A", ClassOutcome::Pass),
            CompletionStatus::Recorded
        );
        let before = p.snapshot();
        assert_eq!(
            p.record_completion(fork(1), "A", ClassOutcome::Fail),
            CompletionStatus::Duplicate
        );
        assert_eq!(p.snapshot(), before);
        assert_eq!(p.results()["A"], ClassOutcome::Pass);
    }

    #[test]
    fn test_completion_from_wrong_fork_or_unknown_class() {
        let mut p = pipeline(&["A"]);
        p.register_fork(fork(1));
        p.register_fork(fork(2));
        p.assign_next(fork(1));

        assert_eq!(
            p.record_completion(fork(2), "A", ClassOutcome::Pass),
            CompletionStatus::WrongFork { holder: fork(1) }
        );
        assert_eq!(
            p.record_completion(fork(1), "Z", ClassOutcome::Pass),
            CompletionStatus::NotInFlight
        );
        assert_eq!(p.holding(fork(1)), Some("A"));
        assert!(p.results().is_empty());
    }

    #[test]
    fn test_repeated_class_names_dropped() {
        let p = pipeline(&["A", "B", "A"]);
        assert_eq!(p.snapshot().pending, vec!["A", "B"]);
    }

    #[test]
    fn test_large_backlog_builds_quickly() {
        let names: Vec<String> = (0..100_000).map(|i| format!("Suite{i}")).collect();
        let started = std::time::Instant::now();
        let mut p = Pipeline::new(
            PipelineId::new(0),
            names.iter().cloned().chain(names.iter().take(10).cloned()),
        );
        assert!(
            started.elapsed() < std::time::Duration::from_secs(10),
            "building 100k classes took {:?}",
            started.elapsed()
        );

        assert_eq!(p.snapshot().pending.len(), 100_000);
        p.register_fork(fork(0));
        assert_eq!(p.assign_next(fork(0)), Assignment::Assigned("Suite0".into()));
        assert_eq!(p.next_pending(), Some("Suite1"));
    }

    #[test]
    fn test_transitions_are_forward_only() {
        let mut p = pipeline(&[]);
        p.register_fork(fork(1));
        assert_eq!(
            p.transition_fork(fork(1), ForkState::Running),
            Ok(ForkState::Started)
        );
        assert!(matches!(
            p.transition_fork(fork(1), ForkState::Started),
            Err(TransitionError::Illegal { .. })
        ));
        p.transition_fork(fork(1), ForkState::Stopped).unwrap();
        assert!(p.transition_fork(fork(1), ForkState::Crashed).is_err());
        assert_eq!(
            p.transition_fork(fork(9), ForkState::Running),
            Err(TransitionError::UnknownFork(fork(9)))
        );
    }

    #[test]
    fn test_register_fork_starts_pipeline_once() {
        let mut p = pipeline(&["A"]);
        assert_eq!(p.state(), PipelineState::NotStarted);
        assert!(p.register_fork(fork(1)));
        assert!(!p.register_fork(fork(1)));
        assert_eq!(p.state(), PipelineState::Running);
    }

    #[test]
    fn test_complete_requires_terminal_forks() {
        let mut p = pipeline(&["A"]);
        assert!(!p.is_complete(), "no fork has joined yet");

        p.register_fork(fork(1));
        p.assign_next(fork(1));
        p.record_completion(fork(1), "A", ClassOutcome::Pass);
        p.mark_draining();
        assert_eq!(p.state(), PipelineState::Draining);
        assert!(!p.is_complete());
        assert!(!p.try_complete());

        p.transition_fork(fork(1), ForkState::Stopped).unwrap();
        assert!(p.try_complete());
        assert!(!p.try_complete());
        assert_eq!(p.state(), PipelineState::Complete);
    }

    #[test]
    fn test_in_flight_blocks_completion_after_crash() {
        let mut p = pipeline(&["A"]);
        p.register_fork(fork(1));
        p.assign_next(fork(1));
        p.transition_fork(fork(1), ForkState::Crashed).unwrap();
        assert!(!p.is_complete());
        assert_eq!(p.snapshot().in_flight.get("A"), Some(&fork(1)));
    }

    #[test]
    fn test_reclaim_puts_class_back_at_head() {
        let mut p = pipeline(&["A", "B"]);
        p.register_fork(fork(1));
        p.assign_next(fork(1));
        assert_eq!(p.reclaim_in_flight(fork(1)), Some("A".into()));
        assert_eq!(p.next_pending(), Some("A"));
        assert_eq!(p.holding(fork(1)), None);
        assert_eq!(p.reclaim_in_flight(fork(1)), None);
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut p = pipeline(&["A", "B"]);
        p.register_fork(fork(3));
        p.assign_next(fork(3));
        let json = serde_json::to_value(p.snapshot()).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["pending"][0], "B");
        assert_eq!(json["in_flight"]["A"], 3);
        assert_eq!(json["forks"]["3"], "started");
    }

    mod proptest_assignment {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(200))]

            /// Under any interleaving of forks, each class is handed out once
            /// and every class ends with exactly one outcome.
            #[test]
            fn test_every_class_assigned_exactly_once(
                class_count in 0usize..40,
                fork_count in 1u32..6,
                schedule in proptest::collection::vec(0u32..6, 0..400),
            ) {
                let classes: Vec<String> = (0..class_count).map(|i| format!("C{i}")).collect();
                let mut p = Pipeline::new(PipelineId::new(0), classes.clone());
                for f in 0..fork_count {
                    p.register_fork(ForkId::new(f));
                }

                let mut handed_out = Vec::new();
                let step = |p: &mut Pipeline, f: ForkId, handed_out: &mut Vec<String>| {
                    if let Some(class) = p.holding(f).map(str::to_string) {
                        prop_assert_eq!(
                            p.record_completion(f, &class, ClassOutcome::Pass),
                            CompletionStatus::Recorded
                        );
                    } else if let Assignment::Assigned(class) = p.assign_next(f) {
                        handed_out.push(class);
                    }
                    Ok(())
                };

                for pick in schedule {
                    step(&mut p, ForkId::new(pick % fork_count), &mut handed_out)?;
                }
                // Drain whatever the random schedule left over.
                while p.next_pending().is_some() || !p.snapshot().in_flight.is_empty() {
                    for f in 0..fork_count {
                        step(&mut p, ForkId::new(f), &mut handed_out)?;
                    }
                }

                let mut sorted = handed_out.clone();
                sorted.sort();
                sorted.dedup();
                prop_assert_eq!(sorted.len(), handed_out.len());
                prop_assert_eq!(handed_out.len(), classes.len());
                prop_assert_eq!(p.results().len(), classes.len());
            }
        }
    }
}
