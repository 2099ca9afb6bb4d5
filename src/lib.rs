//! Realtime Client - Main Library
//!
//! Thin application layer over the `realtime` transport library.
//!
//! ## Architecture
//!
//! - **bin_common**: Common utilities for binary executables (CLI, logging, runners)
//! - **realtime**: Transports and orchestrators (re-exported from workspace)
//!
//! ## Usage in Binaries
//!
//! ```rust,ignore
//! use realtime_client::bin_common::{load_config_from_env, ConfigType};
//! use realtime_client::realtime::PriorityManager;
//! ```

// Re-export workspace libraries for convenience
pub use realtime;

// Binary common utilities
pub mod bin_common {
    //! Common utilities for binary executables

    pub mod cli;
    pub mod logging;
    pub mod runner;

    pub use cli::{load_config_from_env, load_priority_config, parse_args, ConfigType};
    pub use logging::init_tracing;
    pub use runner::{BinaryRunner, RunConfig, ShutdownManager};
}
