//! # Realtime
//!
//! Client-side realtime transport layer with automatic fallback.
//!
//! ## Features
//!
//! - **Three adapters, one surface**: socket, push stream and polling all
//!   implement [`Transport`]
//! - **Reconnection**: exponential backoff with jitter and server-suggested delays
//! - **Liveness**: heartbeat pings with timeouts and optional latency sampling
//! - **Resumption**: last-seen event id persisted and replayed on reconnect
//! - **Orchestration**: two-level fallback and a priority manager with upgrades

pub mod traits;
pub mod core;
pub mod manager;

// Re-export all traits
pub use traits::*;

// Re-export core adapters
pub use core::{
    config, factory, polling, socket, stream,
    config::TransportConfig,
    factory::{AdapterFactory, TransportFactory},
    polling::PollingTransport,
    socket::SocketTransport,
    stream::PushStreamTransport,
};

// Re-export orchestrators
pub use manager::{
    FallbackConfig, PriorityConfig, PriorityManager, PriorityState, TwoLevelFallback,
    UPGRADE_GRACE_PERIOD,
};
