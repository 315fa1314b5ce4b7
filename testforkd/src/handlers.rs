//! Server-side control message handlers.
//!
//! One handler set exists per connection, bound to the fork that announced
//! itself on it. Handlers reach the pipeline only through the dispatcher.

use crate::dispatcher::PipelineDispatcher;
use std::sync::Arc;
use testfork_common::{ControlMessage, ForkId};
use tracing::warn;

pub struct ServerMessageHandlers {
    dispatcher: Arc<PipelineDispatcher>,
    fork: ForkId,
}

impl ServerMessageHandlers {
    pub fn new(dispatcher: Arc<PipelineDispatcher>, fork: ForkId) -> Self {
        Self { dispatcher, fork }
    }

    #[cfg(test)]
    pub fn fork(&self) -> ForkId {
        self.fork
    }

    #[cfg(test)]
    pub fn dispatcher(&self) -> &Arc<PipelineDispatcher> {
        &self.dispatcher
    }

    /// Handle one inbound message, returning the reply to send, if any.
    pub fn handle(&self, message: ControlMessage) -> Option<ControlMessage> {
        if let Some(claimed) = message.fork_id()
            && claimed != self.fork
        {
            warn!(
                "Pipeline {}: connection of fork {} sent {} claiming fork {}; ignoring",
                self.dispatcher.id(),
                self.fork,
                message.kind(),
                claimed
            );
            return None;
        }

        match message {
            ControlMessage::RequestNextClass { .. } => self.dispatcher.request_next_class(self.fork),
            ControlMessage::ClassCompleted {
                class_name,
                outcome,
            } => {
                self.dispatcher
                    .class_completed(self.fork, &class_name, outcome);
                None
            }
            ControlMessage::ForkStopped { .. } => {
                self.dispatcher.fork_stopped(self.fork);
                None
            }
            other => {
                warn!(
                    "Pipeline {}: unexpected {} from fork {}; ignoring",
                    self.dispatcher.id(),
                    other.kind(),
                    self.fork
                );
                None
            }
        }
    }
}
