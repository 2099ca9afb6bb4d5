use crate::traits::transport::TransportKind;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the realtime transports
///
/// Every failure is raised with the variant that describes it, so
/// escalation decisions never need to inspect message text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The instance was destroyed and can no longer be used
    #[error("Transport destroyed")]
    Destroyed,

    /// Operation requires an open connection
    #[error("Not connected")]
    NotConnected,

    /// Requested transport kind is not available on this platform
    #[error("Transport not supported: {0}")]
    Unsupported(TransportKind),

    /// Active transport has no outbound channel
    #[error("Transport {0} does not support sending")]
    SendUnsupported(TransportKind),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connectivity failure (refused, reset, DNS, TLS, ...)
    #[error("Network error: {0}")]
    Network(String),

    /// Non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Server or platform reports the mechanism as unsupported
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Inbound payload could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),

    /// No pong arrived for a heartbeat ping
    #[error("Heartbeat timed out after {0:?}")]
    HeartbeatTimeout(Duration),

    /// Request exceeded its deadline
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Server closed the event stream
    #[error("Stream ended")]
    StreamEnded,

    /// Connection closed unexpectedly
    #[error("Connection closed: {0}")]
    Closed(String),

    /// Resumption cursor store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

/// How an orchestrator should react to a transport error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The mechanism itself is unusable here; move to another transport kind
    Fatal,
    /// Retry locally with backoff
    Transient,
}

impl TransportError {
    /// Classify the error for escalation
    ///
    /// Fatal: connectivity failures, unsupported mechanisms and HTTP
    /// 404/405/501. Everything else is transient.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            TransportError::Network(_)
            | TransportError::NotSupported(_)
            | TransportError::Unsupported(_)
            | TransportError::SendUnsupported(_) => FailureClass::Fatal,
            TransportError::Http { status, .. } if matches!(status, 404 | 405 | 501) => {
                FailureClass::Fatal
            }
            _ => FailureClass::Transient,
        }
    }

    /// Shorthand for `failure_class() == FailureClass::Fatal`
    pub fn is_fatal(&self) -> bool {
        self.failure_class() == FailureClass::Fatal
    }

    /// Build an HTTP error from a status code
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        TransportError::Http {
            status,
            message: message.into(),
        }
    }
}

/// Result type for realtime transport operations
pub type Result<T> = std::result::Result<T, TransportError>;
