//! Transport error types.

use thiserror::Error;

/// A specialized `Result` type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Represents errors that can occur during transport operations.
///
/// The variants encode the failure taxonomy every transport loop classifies
/// against: deliberate cancellation (never surfaced to consumers), benign
/// transport-level disconnects (swallowed but retried), and genuine failures
/// (surfaced once via the error hook).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    /// The operation was deliberately cancelled by the caller or host shutdown.
    #[error("Operation cancelled")]
    Cancelled,

    /// Failed to establish a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection was lost mid-stream.
    ///
    /// This is the benign-disconnect class: proxies and servers routinely
    /// drop otherwise-healthy long-lived requests.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Failed to send a message.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive a message.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Failed to serialize or deserialize a payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// A protocol-level error occurred (unexpected status, malformed frame).
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The operation did not complete within the allotted time.
    #[error("Operation timed out")]
    Timeout,

    /// No candidate transport completed its handshake.
    #[error("Transport failed to start: {0}")]
    StartFailed(String),

    /// The transport was configured with invalid parameters.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An underlying I/O error occurred.
    #[error("IO error: {0}")]
    Io(String),

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// Returns `true` if this error represents a deliberate cancellation.
    ///
    /// Cancellations are never surfaced through the error hook and never
    /// trigger a retry.
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if this error is a benign transport-level disconnect.
    ///
    /// Benign disconnects are swallowed (no error hook) but still trigger a
    /// reconnect attempt after the fixed retry delay.
    pub const fn is_benign_disconnect(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Io(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_classification() {
        assert!(TransportError::Cancelled.is_cancellation());
        assert!(!TransportError::Timeout.is_cancellation());
        assert!(!TransportError::ConnectionLost("reset".into()).is_cancellation());
    }

    #[test]
    fn test_benign_disconnect_classification() {
        assert!(TransportError::ConnectionLost("peer reset".into()).is_benign_disconnect());
        assert!(TransportError::Io("broken pipe".into()).is_benign_disconnect());
        assert!(!TransportError::ProtocolError("bad frame".into()).is_benign_disconnect());
        assert!(!TransportError::Cancelled.is_benign_disconnect());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
        let err: TransportError = io.into();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
