//! # Realtime Traits
//!
//! Core traits and types shared by every transport and orchestrator:
//!
//! - **Transport**: the uniform connect/send/on/state surface
//! - **EventHandlers**: name-keyed handler registry with unsubscribe handles
//! - **Message**: the JSON record exchanged with the server
//! - **ReconnectionStrategy**: backoff policy for lost connections
//! - **CursorStore**: best-effort persistence for the resumption cursor
//! - **TransportSupport**: feature detection
//!
//! ## Example
//!
//! ```rust,ignore
//! use realtime::traits::*;
//!
//! let sub = transport.on("chat".into(), handler(|event| {
//!     if let Some(msg) = event.message() {
//!         println!("chat: {:?}", msg.data);
//!     }
//! }));
//! ```

pub mod cursor;
pub mod error;
pub mod events;
pub mod message;
pub mod reconnect;
pub mod support;
pub mod transport;

// Re-export commonly used types
pub use cursor::{CursorStore, MemoryCursorStore, NoCursorStore, ResumeCursor};
pub use error::{FailureClass, Result, TransportError};
pub use events::{handler, Event, EventHandlers, EventName, EventPayload, Handler, Subscription};
pub use message::{now_millis, Message, PING_TYPE, PONG_TYPE};
pub use reconnect::{ExponentialBackoff, ReconnectionStrategy};
pub use support::{AllSupported, StaticSupport, TransportSupport};
pub use transport::{ConnectionState, ConnectionStatus, SwitchReason, Transport, TransportKind};
