//! Error types shared by the control server and the forks.

use thiserror::Error;

/// Errors raised while reading or writing control-message frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying transport failed. Terminal for the connection.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame announced a body larger than the protocol allows. Terminal,
    /// since the stream can no longer be trusted.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// A complete frame was read but its body is not a control message.
    /// The stream stays aligned, so the frame can be skipped.
    #[error("malformed control message: {0}")]
    Decode(#[source] serde_json::Error),

    /// A control message could not be encoded.
    #[error("failed to encode control message: {0}")]
    Encode(#[source] serde_json::Error),

    /// The peer closed the connection in the middle of a frame.
    #[error("connection closed mid-frame")]
    Truncated,
}

impl ProtocolError {
    /// Whether the connection can keep being read after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_decode_errors_are_recoverable() {
        let decode = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(ProtocolError::Decode(decode).is_recoverable());
        assert!(!ProtocolError::Truncated.is_recoverable());
        assert!(!ProtocolError::FrameTooLarge { len: 10, max: 5 }.is_recoverable());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(!ProtocolError::Io(io).is_recoverable());
    }

    #[test]
    fn test_frame_too_large_message() {
        let err = ProtocolError::FrameTooLarge { len: 10, max: 5 };
        assert_eq!(err.to_string(), "frame of 10 bytes exceeds the 5 byte limit");
    }
}
