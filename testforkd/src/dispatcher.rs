//! Pipeline dispatcher: the server-side owner of one pipeline.
//!
//! Every connection session of a pipeline shares one dispatcher through an
//! `Arc`. All pipeline mutations happen under the dispatcher's lock, so class
//! assignment is atomic across concurrent forks. Lifecycle changes are
//! published on the [`EventBus`].

use crate::events::EventBus;
use crate::pipeline::{Assignment, CompletionStatus, Pipeline, PipelineSnapshot};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use testfork_common::{
    ClassOutcome, ControlMessage, ForkId, ForkState, PipelineId, PipelineState, ReclaimPolicy,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Outbound control messages for one fork's connection.
pub type Outbound = mpsc::UnboundedSender<ControlMessage>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown pipeline {0}")]
    UnknownPipeline(PipelineId),

    #[error("fork {fork} already registered with pipeline {pipeline}")]
    DuplicateFork { pipeline: PipelineId, fork: ForkId },
}

struct DispatcherState {
    pipeline: Pipeline,
    outbound: HashMap<ForkId, Outbound>,
    /// Set by `stop_all`; no class is handed out afterwards.
    stopping: bool,
}

pub struct PipelineDispatcher {
    id: PipelineId,
    state: Mutex<DispatcherState>,
    completion: watch::Sender<bool>,
    events: EventBus,
    reclaim: ReclaimPolicy,
}

impl PipelineDispatcher {
    pub fn new(pipeline: Pipeline, events: EventBus, reclaim: ReclaimPolicy) -> Self {
        let (completion, _) = watch::channel(false);
        Self {
            id: pipeline.id(),
            state: Mutex::new(DispatcherState {
                pipeline,
                outbound: HashMap::new(),
                stopping: false,
            }),
            completion,
            events,
            reclaim,
        }
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        // Pipeline updates are single assignments; a panicking holder cannot
        // leave it half-written.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move `fork` to `next` and publish the change.
    fn transition(&self, pipeline: &mut Pipeline, fork: ForkId, next: ForkState) -> bool {
        match pipeline.transition_fork(fork, next) {
            Ok(from) if from != next => {
                debug!("Pipeline {}: fork {} {} -> {}", self.id, fork, from, next);
                self.events.fork_state(self.id, fork, from, next);
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("Pipeline {}: {}", self.id, e);
                false
            }
        }
    }

    /// Publish pipeline completion once.
    fn finalize(&self, pipeline: &mut Pipeline) {
        if pipeline.try_complete() {
            let snapshot = pipeline.snapshot();
            info!(
                "Pipeline {} complete: {} classes, {} failed, {} errored",
                self.id,
                snapshot.results.len(),
                snapshot.count(ClassOutcome::Fail),
                snapshot.count(ClassOutcome::Error)
            );
            self.events.pipeline_state(self.id, PipelineState::Complete);
            self.completion.send_replace(true);
        }
    }

    // ── Fork lifecycle ───────────────────────────────────────────────────

    /// Register a connected fork and the channel its session writes from.
    pub fn fork_started(&self, fork: ForkId, outbound: Outbound) -> Result<(), DispatchError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let was = state.pipeline.state();
        if !state.pipeline.register_fork(fork) {
            return Err(DispatchError::DuplicateFork {
                pipeline: self.id,
                fork,
            });
        }
        state.outbound.insert(fork, outbound);

        info!("Pipeline {}: fork {} started", self.id, fork);
        self.events.fork_started(self.id, fork);
        self.events
            .fork_state(self.id, fork, ForkState::Connecting, ForkState::Started);
        if was != state.pipeline.state() {
            self.events.pipeline_state(self.id, state.pipeline.state());
        }
        Ok(())
    }

    /// Answer a fork's pull for work.
    ///
    /// Returns `None` when the request is out of sequence and must be ignored.
    pub fn request_next_class(&self, fork: ForkId) -> Option<ControlMessage> {
        let mut guard = self.lock();
        if guard.stopping {
            return self.refuse_after_stop(&mut guard.pipeline, fork);
        }
        let pipeline = &mut guard.pipeline;

        match pipeline.assign_next(fork) {
            Assignment::Assigned(class_name) => {
                self.transition(pipeline, fork, ForkState::Running);
                debug!("Pipeline {}: {} -> fork {}", self.id, class_name, fork);
                self.events.class_assigned(self.id, fork, &class_name);
                Some(ControlMessage::ExecuteClass { class_name })
            }
            Assignment::Exhausted => {
                self.transition(pipeline, fork, ForkState::Stopping);
                let was = pipeline.state();
                pipeline.mark_draining();
                if was != pipeline.state() {
                    info!("Pipeline {} draining", self.id);
                    self.events.pipeline_state(self.id, pipeline.state());
                }
                Some(ControlMessage::NoMoreWork)
            }
            Assignment::AlreadyHolding(class_name) => {
                warn!(
                    "Pipeline {}: fork {} asked for work while still running {}; ignoring",
                    self.id, fork, class_name
                );
                None
            }
            Assignment::ForkNotLive => {
                warn!(
                    "Pipeline {}: work request from unknown or finished fork {}; ignoring",
                    self.id, fork
                );
                None
            }
        }
    }

    /// After `stop_all`, live forks get `NoMoreWork` instead of a class.
    fn refuse_after_stop(&self, pipeline: &mut Pipeline, fork: ForkId) -> Option<ControlMessage> {
        match pipeline.fork_state(fork) {
            Some(state) if !state.is_terminal() => {
                if let Some(held) = pipeline.holding(fork) {
                    warn!(
                        "Pipeline {}: fork {} asked for work while still running {}; ignoring",
                        self.id, fork, held
                    );
                    return None;
                }
                self.transition(pipeline, fork, ForkState::Stopping);
                debug!("Pipeline {}: stopping; no more work for fork {}", self.id, fork);
                Some(ControlMessage::NoMoreWork)
            }
            _ => {
                warn!(
                    "Pipeline {}: work request from unknown or finished fork {}; ignoring",
                    self.id, fork
                );
                None
            }
        }
    }

    /// Record a class outcome reported by `fork`.
    pub fn class_completed(&self, fork: ForkId, class_name: &str, outcome: ClassOutcome) {
        let mut guard = self.lock();
        let pipeline = &mut guard.pipeline;

        match pipeline.record_completion(fork, class_name, outcome) {
            CompletionStatus::Recorded => {
                debug!(
                    "Pipeline {}: fork {} finished {} ({})",
                    self.id, fork, class_name, outcome
                );
                self.events
                    .class_completed(self.id, fork, class_name, outcome);
                self.finalize(pipeline);
            }
            CompletionStatus::Duplicate => warn!(
                "Pipeline {}: duplicate completion of {} from fork {}; ignoring",
                self.id, class_name, fork
            ),
            CompletionStatus::NotInFlight => warn!(
                "Pipeline {}: completion of {} which is not in flight; ignoring",
                self.id, class_name
            ),
            CompletionStatus::WrongFork { holder } => warn!(
                "Pipeline {}: fork {} reported {} held by fork {}; ignoring",
                self.id, fork, class_name, holder
            ),
        }
    }

    /// A fork announced its orderly stop.
    pub fn fork_stopped(&self, fork: ForkId) {
        let mut guard = self.lock();
        let state = &mut *guard;

        if let Some(class_name) = state.pipeline.holding(fork) {
            warn!(
                "Pipeline {}: fork {} stopped while holding {}",
                self.id, fork, class_name
            );
            self.reclaim(&mut state.pipeline, fork);
        }
        if self.transition(&mut state.pipeline, fork, ForkState::Stopped) {
            info!("Pipeline {}: fork {} stopped", self.id, fork);
        }
        state.outbound.remove(&fork);
        self.finalize(&mut state.pipeline);
    }

    /// The fork's connection ended. Crashes the fork unless it already stopped.
    pub fn connection_lost(&self, fork: ForkId) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.outbound.remove(&fork);

        match state.pipeline.fork_state(fork) {
            Some(current) if !current.is_terminal() => {
                warn!(
                    "Pipeline {}: lost connection to fork {} while {}",
                    self.id, fork, current
                );
                self.transition(&mut state.pipeline, fork, ForkState::Crashed);
                self.reclaim(&mut state.pipeline, fork);
                self.finalize(&mut state.pipeline);
            }
            Some(_) => debug!("Pipeline {}: fork {} disconnected", self.id, fork),
            None => debug!("Pipeline {}: unregistered connection closed", self.id),
        }
    }

    fn reclaim(&self, pipeline: &mut Pipeline, fork: ForkId) {
        let Some(class_name) = pipeline.holding(fork).map(str::to_string) else {
            return;
        };
        match self.reclaim {
            ReclaimPolicy::Requeue => {
                pipeline.reclaim_in_flight(fork);
                info!(
                    "Pipeline {}: requeued {} from fork {}",
                    self.id, class_name, fork
                );
            }
            ReclaimPolicy::Leave => warn!(
                "Pipeline {}: {} stays in flight on fork {}",
                self.id, class_name, fork
            ),
        }
    }

    /// Ask every live fork to stop. Returns how many were asked.
    pub fn stop_all(&self) -> usize {
        let mut guard = self.lock();
        guard.stopping = true;
        let mut asked = 0;
        for fork in guard.pipeline.live_forks() {
            if let Some(outbound) = guard.outbound.get(&fork)
                && outbound.send(ControlMessage::StopFork).is_ok()
            {
                asked += 1;
            }
        }
        if asked > 0 {
            info!("Pipeline {}: asked {} forks to stop", self.id, asked);
        }
        asked
    }

    // ── Observation ──────────────────────────────────────────────────────

    pub fn is_complete(&self) -> bool {
        *self.completion.borrow()
    }

    /// Resolve once the pipeline is complete.
    pub async fn wait_complete(&self) -> PipelineSnapshot {
        let mut rx = self.completion.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|done| *done).await;
        self.snapshot()
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        self.lock().pipeline.snapshot()
    }
}

/// All dispatchers of a run, keyed by pipeline id.
#[derive(Default)]
pub struct PipelineRegistry {
    dispatchers: BTreeMap<PipelineId, Arc<PipelineDispatcher>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dispatcher: PipelineDispatcher) -> Arc<PipelineDispatcher> {
        let dispatcher = Arc::new(dispatcher);
        self.dispatchers
            .insert(dispatcher.id(), Arc::clone(&dispatcher));
        dispatcher
    }

    pub fn get(&self, id: PipelineId) -> Result<Arc<PipelineDispatcher>, DispatchError> {
        self.dispatchers
            .get(&id)
            .cloned()
            .ok_or(DispatchError::UnknownPipeline(id))
    }

    pub fn dispatchers(&self) -> impl Iterator<Item = &Arc<PipelineDispatcher>> {
        self.dispatchers.values()
    }

    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }

    /// Resolve once every pipeline is complete.
    pub async fn wait_all(&self) -> Vec<PipelineSnapshot> {
        let mut snapshots = Vec::with_capacity(self.dispatchers.len());
        for dispatcher in self.dispatchers.values() {
            snapshots.push(dispatcher.wait_complete().await);
        }
        snapshots
    }

    pub fn snapshots(&self) -> Vec<PipelineSnapshot> {
        self.dispatchers.values().map(|d| d.snapshot()).collect()
    }

    pub fn stop_all(&self) -> usize {
        self.dispatchers.values().map(|d| d.stop_all()).sum()
    }
}
