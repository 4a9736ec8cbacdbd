//! Error types for the Hearth process link.
//!
//! Transport failures, protocol decode failures, wait time-outs and long
//! operation failures all surface through [`HearthError`]. Programming-contract
//! violations (re-entrant waits, waiting without an attached channel) are not
//! errors; they panic.

use std::time::Duration;
use thiserror::Error;

use crate::ipc::message::MessageKind;

/// Main error type for the Hearth library.
#[derive(Debug, Error)]
pub enum HearthError {
    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Channel is not connected")]
    NotConnected,

    #[error("Message size {size} exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    // Communication channel errors
    #[error("Ignored send message of type {sent} because it is not {allowed}")]
    MessageGated {
        sent: MessageKind,
        allowed: MessageKind,
    },

    #[error("Reached time-out of {timeout:?} while waiting for {kind}")]
    Timeout { timeout: Duration, kind: String },

    #[error("Lost connection while waiting for {kind}")]
    ConnectionLost { kind: String },

    // Protocol errors
    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    // Long operation errors
    #[error("Unknown long operation type: {0}")]
    UnknownOperationType(String),

    #[error("Long operation {0} is already tracked")]
    DuplicateOperation(uuid::Uuid),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Long operation failed: {message}")]
    OperationFailed { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Hearth operations.
pub type Result<T> = std::result::Result<T, HearthError>;

impl From<std::io::Error> for HearthError {
    fn from(err: std::io::Error) -> Self {
        HearthError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl HearthError {
    /// Create a decode error from any displayable message.
    pub fn decode(message: impl Into<String>) -> Self {
        HearthError::Decode {
            message: message.into(),
        }
    }

    /// Create an operation failure from any displayable message.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        HearthError::OperationFailed {
            message: message.into(),
        }
    }

    /// Check if this error goes away by reconnecting the channel.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            HearthError::Io { .. } | HearthError::NotConnected | HearthError::ConnectionLost { .. }
        )
    }

    /// Check if this error is the expected outcome of a bounded wait.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HearthError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HearthError::Timeout {
            timeout: Duration::from_secs(5),
            kind: "LongOpResultMsg".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Reached time-out of 5s while waiting for LongOpResultMsg"
        );

        let err = HearthError::ConnectionLost {
            kind: "ProcessHandshakeMsg".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Lost connection while waiting for ProcessHandshakeMsg"
        );
    }

    #[test]
    fn test_gated_display_names_both_kinds() {
        let err = HearthError::MessageGated {
            sent: MessageKind::LongOpProgress,
            allowed: MessageKind::Handshake,
        };
        assert_eq!(
            err.to_string(),
            "Ignored send message of type LongOpProgressMsg because it is not ProcessHandshakeMsg"
        );
    }

    #[test]
    fn test_transport_errors() {
        assert!(HearthError::NotConnected.is_transport_error());
        assert!(HearthError::from(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe closed"
        ))
        .is_transport_error());
        assert!(!HearthError::Cancelled.is_transport_error());
        assert!(!HearthError::decode("bad").is_transport_error());
    }
}
