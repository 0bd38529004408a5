//! Error types for the Stratus messaging framework.

use std::time::Duration;

use serde_json::Value;

/// Main error type for Stratus operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StratusError {
    /// Transport-level error (connection, IO, etc.)
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Codec error (framing/serialization)
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Error payload delivered by the remote peer.
    ///
    /// This covers both handler failures and the `NO_MESSAGE_HANDLER`
    /// response for unrouteable requests; they are data on the wire,
    /// not local defects.
    #[error("remote error: {0}")]
    Remote(Value),

    /// The call saw no terminal packet within the configured window.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The call was cancelled locally.
    #[error("call cancelled")]
    Cancelled,
}

/// Transport-level errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// IO error from the underlying transport
    #[error("io error: {0}")]
    Io(std::sync::Arc<std::io::Error>),

    /// Connection was closed unexpectedly
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to connect to the remote endpoint
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The reconnect attempt budget was exhausted
    #[error("gave up after {attempts} reconnect attempts")]
    RetriesExhausted {
        /// Number of attempts made before giving up
        attempts: u32,
    },

    /// Operation attempted while the adapter is not connected
    #[error("not connected")]
    NotConnected,

    /// Subscription could not be established
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Protocol violation by the peer
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Codec errors for framing and payload parsing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    /// The length prefix of a frame could not be parsed
    #[error("corrupted length value: {0}")]
    CorruptedLength(String),

    /// A complete frame held a payload that is not valid JSON
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Frame size exceeds maximum allowed
    #[error("frame too large: {size} units (max: {max})")]
    FrameTooLarge {
        /// Declared frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Outbound message could not be serialized
    #[error("serialization error: {0}")]
    Serialize(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(std::sync::Arc::new(e))
    }
}

impl StratusError {
    /// Check if this error is transient and worth a reconnect attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(TransportError::Io(_))
                | Self::Transport(TransportError::ConnectionClosed)
                | Self::Transport(TransportError::ConnectionFailed(_))
        )
    }

    /// Check if this error is fatal to the current connection.
    ///
    /// Protocol violations (corrupted length, malformed JSON frames) are
    /// never retried at the framing layer; the owning adapter terminates
    /// the connection and decides whether to reconnect.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(TransportError::ConnectionClosed)
                | Self::Transport(TransportError::Io(_))
                | Self::Transport(TransportError::Protocol(_))
                | Self::Codec(CodecError::CorruptedLength(_))
                | Self::Codec(CodecError::InvalidPayload(_))
                | Self::Codec(CodecError::FrameTooLarge { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StratusError::Remote(Value::String("boom".into()));
        assert_eq!(err.to_string(), "remote error: \"boom\"");

        let err = StratusError::Transport(TransportError::RetriesExhausted { attempts: 3 });
        assert_eq!(
            err.to_string(),
            "transport error: gave up after 3 reconnect attempts"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(StratusError::Transport(TransportError::ConnectionClosed).is_retryable());
        assert!(!StratusError::Cancelled.is_retryable());
        assert!(!StratusError::Codec(CodecError::CorruptedLength("x".into())).is_retryable());
    }

    #[test]
    fn test_protocol_errors_are_fatal() {
        assert!(StratusError::Codec(CodecError::InvalidPayload("bad".into())).is_connection_fatal());
        assert!(StratusError::Codec(CodecError::CorruptedLength("bad".into())).is_connection_fatal());
        assert!(!StratusError::Remote(Value::Null).is_connection_fatal());
    }
}
