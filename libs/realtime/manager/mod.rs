//! # Realtime Manager
//!
//! Orchestrators that compose adapters into one resilient connection:
//!
//! - [`TwoLevelFallback`]: push stream with a one-time switch to polling
//! - [`PriorityManager`]: priority-ordered transports with failure-counted
//!   fallback and optional timed upgrades
//!
//! Both own the consumer handler registry. Handlers registered through `on`
//! survive every switch; the active adapter only ever sees forwarders.

pub(crate) mod relay;
pub mod fallback;
pub mod priority;

pub use fallback::{FallbackConfig, TwoLevelFallback};
pub use priority::{PriorityConfig, PriorityManager, PriorityState, UPGRADE_GRACE_PERIOD};
pub use crate::core::*;
