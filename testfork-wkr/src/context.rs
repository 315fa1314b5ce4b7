//! Fork-wide context handed to every component explicitly.

use testfork_common::{ForkConfig, ForkId, PipelineId};
use tracing::Span;

/// Identity and configuration of this fork process.
#[derive(Debug, Clone)]
pub struct ForkContext {
    pub pipeline_id: PipelineId,
    pub fork_id: ForkId,
    pub server_port: u16,
    pub config: ForkConfig,
}

impl ForkContext {
    pub fn new(pipeline_id: PipelineId, fork_id: ForkId, server_port: u16, config: ForkConfig) -> Self {
        Self {
            pipeline_id,
            fork_id,
            server_port,
            config,
        }
    }

    /// Span wrapping everything this fork logs.
    pub fn span(&self) -> Span {
        tracing::info_span!("fork", pipeline = %self.pipeline_id, fork = %self.fork_id)
    }
}
