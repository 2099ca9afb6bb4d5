//! # Realtime Core
//!
//! The three adapters and the machinery they share:
//!
//! - [`SocketTransport`]: persistent bidirectional socket
//! - [`PushStreamTransport`]: server-push event stream with POSTed sends
//! - [`PollingTransport`]: GET/POST polling loop
//!
//! Each adapter instance owns its background tasks. Disconnecting aborts
//! them, and a per-connection generation counter discards anything a
//! torn-down connection still tries to report.
//!
//! ## Example
//!
//! ```rust,ignore
//! use realtime::core::*;
//!
//! let transport = SocketTransport::new(
//!     TransportConfig::new("wss://example.com/live").with_token("secret"),
//! );
//! let _sub = transport.on(EventName::Message, handler(|event| {
//!     println!("{:?}", event.message());
//! }));
//! transport.connect()?;
//! ```

pub(crate) mod adapter;
pub mod config;
pub mod factory;
pub mod heartbeat;
pub mod http;
pub mod latency;
pub mod polling;
pub mod socket;
pub mod stream;

// Re-export main types
pub use config::TransportConfig;
pub use factory::{AdapterFactory, TransportFactory};
pub use heartbeat::PendingPings;
pub use http::{HttpExchange, ReqwestExchange};
pub use latency::{LatencySample, LatencySampler, MAX_SAMPLES};
pub use polling::{PollingTransport, MAX_CONSECUTIVE_ERRORS};
pub use socket::{SocketConnector, SocketSink, SocketStream, SocketTransport, TungsteniteConnector};
pub use stream::{
    select_stream_mode, ByteStream, HttpStreamSource, PushStreamTransport, StreamMode,
    StreamRequest, StreamSource,
};

// Re-export traits for convenience
pub use crate::traits::*;
