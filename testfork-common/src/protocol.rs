//! Control-message protocol between forks and the control server.
//!
//! Messages are JSON objects tagged by `type`, carried in frames made of a
//! 4-byte big-endian body length followed by the body. Both a blocking codec
//! (used by the fork's receive and consumer threads) and a tokio codec (used
//! by the server's connection tasks) are provided.
//!
//! Per connection the causal order is fixed: `ForkStarted` precedes any
//! `RequestNextClass`, and `ForkStopped` is the last message a fork sends.

use crate::errors::ProtocolError;
use crate::types::{ClassOutcome, ForkId, PipelineId};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const HEADER_LEN: usize = 4;

/// A unit of the fork <-> server protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// fork -> server: the fork is connected and ready.
    ForkStarted {
        pipeline_id: PipelineId,
        fork_id: ForkId,
    },
    /// fork -> server: pull the next class.
    RequestNextClass { fork_id: ForkId },
    /// server -> fork: run this class.
    ExecuteClass { class_name: String },
    /// fork -> server: a class finished.
    ClassCompleted {
        class_name: String,
        outcome: ClassOutcome,
    },
    /// server -> fork: the backlog is empty.
    NoMoreWork,
    /// server -> fork: stop after the current message.
    StopFork,
    /// fork -> server: last message before disconnecting.
    ForkStopped { fork_id: ForkId },
}

impl ControlMessage {
    pub fn execute_class(class_name: impl Into<String>) -> Self {
        Self::ExecuteClass {
            class_name: class_name.into(),
        }
    }

    pub fn class_completed(class_name: impl Into<String>, outcome: ClassOutcome) -> Self {
        Self::ClassCompleted {
            class_name: class_name.into(),
            outcome,
        }
    }

    /// Short name of the message kind, for logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ForkStarted { .. } => "fork_started",
            Self::RequestNextClass { .. } => "request_next_class",
            Self::ExecuteClass { .. } => "execute_class",
            Self::ClassCompleted { .. } => "class_completed",
            Self::NoMoreWork => "no_more_work",
            Self::StopFork => "stop_fork",
            Self::ForkStopped { .. } => "fork_stopped",
        }
    }

    /// The fork id carried by the message, if the kind has one.
    pub fn fork_id(&self) -> Option<ForkId> {
        match self {
            Self::ForkStarted { fork_id, .. }
            | Self::RequestNextClass { fork_id }
            | Self::ForkStopped { fork_id } => Some(*fork_id),
            _ => None,
        }
    }

    /// Serialize into a complete frame (header + body).
    pub fn to_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = serde_json::to_vec(self).map_err(ProtocolError::Encode)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                len: body.len(),
                max: MAX_FRAME_LEN,
            });
        }
        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    fn from_body(body: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(body).map_err(ProtocolError::Decode)
    }
}

impl std::fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ForkStarted {
                pipeline_id,
                fork_id,
            } => write!(f, "fork_started(pipeline={pipeline_id}, fork={fork_id})"),
            Self::RequestNextClass { fork_id } => write!(f, "request_next_class(fork={fork_id})"),
            Self::ExecuteClass { class_name } => write!(f, "execute_class({class_name})"),
            Self::ClassCompleted {
                class_name,
                outcome,
            } => write!(f, "class_completed({class_name}, {outcome})"),
            Self::ForkStopped { fork_id } => write!(f, "fork_stopped(fork={fork_id})"),
            other => write!(f, "{}", other.kind()),
        }
    }
}

fn body_len(header: [u8; HEADER_LEN]) -> Result<usize, ProtocolError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(len)
}

fn truncated_on_eof(err: std::io::Error) -> ProtocolError {
    if err.kind() == ErrorKind::UnexpectedEof {
        ProtocolError::Truncated
    } else {
        ProtocolError::Io(err)
    }
}

// ── Blocking codec ───────────────────────────────────────────────────────

/// Write one message and flush.
pub fn write_message<W: Write>(writer: &mut W, message: &ControlMessage) -> Result<(), ProtocolError> {
    let frame = message.to_frame()?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one message.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between
/// frames.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<ControlMessage>, ProtocolError> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ProtocolError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let mut body = vec![0u8; body_len(header)?];
    reader.read_exact(&mut body).map_err(truncated_on_eof)?;
    ControlMessage::from_body(&body).map(Some)
}

// ── Async codec ──────────────────────────────────────────────────────────

/// Write one message and flush (tokio).
pub async fn write_message_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ControlMessage,
) -> Result<(), ProtocolError> {
    let frame = message.to_frame()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message (tokio). Same EOF semantics as [`read_message`].
pub async fn read_message_async<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<ControlMessage>, ProtocolError> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut header[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => return Err(ProtocolError::Truncated),
            n => filled += n,
        }
    }

    let mut body = vec![0u8; body_len(header)?];
    reader.read_exact(&mut body).await.map_err(truncated_on_eof)?;
    ControlMessage::from_body(&body).map(Some)
}
