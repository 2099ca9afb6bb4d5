use crate::traits::error::{Result, TransportError};
use crate::traits::events::{EventName, Handler, Subscription};
use crate::traits::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three substitutable wire mechanisms, best first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Persistent bidirectional socket
    #[serde(rename = "websocket")]
    WebSocket,
    /// Server-to-client event stream with an auxiliary request channel
    #[serde(rename = "push-stream")]
    PushStream,
    /// Request/response polling
    #[serde(rename = "polling")]
    Polling,
}

impl TransportKind {
    /// Canonical priority order (most capable first)
    pub const PRIORITY: [TransportKind; 3] = [
        TransportKind::WebSocket,
        TransportKind::PushStream,
        TransportKind::Polling,
    ];

    /// Position in [`TransportKind::PRIORITY`] (0 is best)
    pub fn rank(self) -> usize {
        match self {
            TransportKind::WebSocket => 0,
            TransportKind::PushStream => 1,
            TransportKind::Polling => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::PushStream => "push-stream",
            TransportKind::Polling => "polling",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection status
///
/// Socket and push-stream adapters use `Disconnected`, `Connecting`,
/// `Connected` and `Reconnecting`. Polling uses `Disconnected`, `Polling`,
/// `Waiting` and `Reconnecting`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Polling,
    Waiting,
}

impl ConnectionStatus {
    /// True when the transport can carry traffic
    #[inline]
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connected | ConnectionStatus::Polling | ConnectionStatus::Waiting
        )
    }
}

/// Snapshot of one adapter's connection state
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Reset to 0 on every successful (re)connection
    pub reconnect_attempts: u32,
    /// Last measured round trip in milliseconds
    pub latency: Option<u64>,
    /// Rounded mean of the retained latency samples
    pub average_latency: Option<u64>,
    pub error: Option<TransportError>,
    /// Resumption cursor
    pub last_event_id: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            latency: None,
            average_latency: None,
            error: None,
            last_event_id: None,
        }
    }
}

/// Why an orchestrator changed its active transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    FeatureDetection,
    Fallback,
    Upgrade,
    Forced,
}

impl SwitchReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SwitchReason::FeatureDetection => "feature_detection",
            SwitchReason::Fallback => "fallback",
            SwitchReason::Upgrade => "upgrade",
            SwitchReason::Forced => "forced",
        }
    }
}

impl fmt::Display for SwitchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common surface of every adapter and orchestrator
///
/// `connect`, `disconnect` and `destroy` only change state and schedule
/// work on the runtime, so they return immediately. Usage errors (connect
/// after destroy, send while disconnected) come back as `Err`; transport
/// failures are reported through the `error` event instead.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wire mechanism currently carrying traffic
    fn kind(&self) -> TransportKind;

    /// Start connecting. No-op when already connected.
    fn connect(&self) -> Result<()>;

    /// Stop and suppress automatic reconnection. Idempotent.
    fn disconnect(&self);

    /// Disconnect, drop all handlers and refuse any further `connect`.
    fn destroy(&self);

    /// Send one message to the server
    async fn send(&self, message: Message) -> Result<()>;

    /// Whether `send` is wired to an outbound channel
    fn supports_send(&self) -> bool {
        true
    }

    /// Register a handler; the returned subscription removes it again
    fn on(&self, event: EventName, handler: Handler) -> Subscription;

    /// Current connection state
    fn state(&self) -> ConnectionState;

    #[inline]
    fn is_connected(&self) -> bool {
        self.state().status.is_connected()
    }
}

/// Reject `send` on a transport without an outbound channel
pub(crate) fn ensure_can_send(transport: &dyn Transport) -> Result<()> {
    if transport.supports_send() {
        Ok(())
    } else {
        Err(TransportError::SendUnsupported(transport.kind()))
    }
}
