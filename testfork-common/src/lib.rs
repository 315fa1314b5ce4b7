//! Shared types, protocol, configuration and logging for testfork.
//!
//! `testforkd` (the control server) and `testfork-wkr` (the fork executor)
//! both depend on this crate; everything that crosses the process boundary
//! is defined here.

pub mod config;
pub mod errors;
pub mod logging;
pub mod protocol;
pub mod testing;
pub mod types;

pub use config::{ConfigError, ForkConfig, ReclaimPolicy, ServerConfig, TestForkConfig};
pub use errors::ProtocolError;
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use protocol::{
    ControlMessage, MAX_FRAME_LEN, read_message, read_message_async, write_message,
    write_message_async,
};
pub use types::{ClassOutcome, ForkId, ForkState, PipelineId, PipelineState};
