//! Event broadcast for pipeline and fork lifecycle updates.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use testfork_common::{ClassOutcome, ForkId, ForkState, PipelineId, PipelineState};
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

/// Broadcast channel for server events (JSON lines).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    /// Create a new event bus. The buffer is never smaller than
    /// `DEFAULT_BUFFER`.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Emit a structured event with payload.
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) {
        let payload = json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match serde_json::to_string(&payload) {
            Ok(serialized) => {
                // No subscribers is fine.
                let _ = self.sender.send(serialized);
            }
            Err(err) => warn!("Failed to serialize event {}: {}", event, err),
        }
    }

    pub fn fork_started(&self, pipeline: PipelineId, fork: ForkId) {
        self.emit("fork_started", &ForkEvent { pipeline, fork });
    }

    pub fn class_assigned(&self, pipeline: PipelineId, fork: ForkId, class_name: &str) {
        self.emit(
            "class_assigned",
            &ClassAssigned {
                pipeline,
                fork,
                class_name,
            },
        );
    }

    pub fn class_completed(
        &self,
        pipeline: PipelineId,
        fork: ForkId,
        class_name: &str,
        outcome: ClassOutcome,
    ) {
        self.emit(
            "class_completed",
            &ClassCompleted {
                pipeline,
                fork,
                class_name,
                outcome,
            },
        );
    }

    pub fn fork_state(&self, pipeline: PipelineId, fork: ForkId, from: ForkState, to: ForkState) {
        self.emit(
            "fork_state",
            &ForkStateChanged {
                pipeline,
                fork,
                from,
                to,
            },
        );
    }

    pub fn pipeline_state(&self, pipeline: PipelineId, state: PipelineState) {
        self.emit("pipeline_state", &PipelineStateChanged { pipeline, state });
    }
}

#[derive(Serialize)]
struct ForkEvent {
    pipeline: PipelineId,
    fork: ForkId,
}

#[derive(Serialize)]
struct ClassAssigned<'a> {
    pipeline: PipelineId,
    fork: ForkId,
    class_name: &'a str,
}

#[derive(Serialize)]
struct ClassCompleted<'a> {
    pipeline: PipelineId,
    fork: ForkId,
    class_name: &'a str,
    outcome: ClassOutcome,
}

#[derive(Serialize)]
struct ForkStateChanged {
    pipeline: PipelineId,
    fork: ForkId,
    from: ForkState,
    to: ForkState,
}

#[derive(Serialize)]
struct PipelineStateChanged {
    pipeline: PipelineId,
    state: PipelineState,
}
