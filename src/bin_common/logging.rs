//! Logging setup shared by binaries

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber
///
/// Honors `RUST_LOG`; defaults to `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .init();
}
