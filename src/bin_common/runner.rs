//! Binary runner utilities
//!
//! Provides a standardized way to run binaries with proper
//! logging, periodic status output and graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::sleep;
use tracing::info;

/// Configuration for running a binary application
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Name of the binary (for logging)
    pub name: String,
    /// Interval between status lines in seconds
    pub status_interval_secs: u64,
}

impl RunConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status_interval_secs: 30,
        }
    }

    pub fn with_status_interval(mut self, secs: u64) -> Self {
        self.status_interval_secs = secs;
        self
    }
}

/// Trait for binary applications
#[allow(async_fn_in_trait)]
pub trait BinaryRunner {
    /// Run the application main loop
    async fn run(&mut self) -> anyhow::Result<()>;

    /// Get the run configuration
    fn config(&self) -> &RunConfig;

    /// Print startup banner
    fn print_banner(&self) {
        let config = self.config();
        info!("");
        info!("========================================");
        info!("Starting {}", config.name);
        info!("Press Ctrl+C to stop");
        info!("========================================");
        info!("");
    }

    /// Print shutdown banner
    fn print_shutdown(&self, stats: Option<&str>) {
        let config = self.config();
        info!("");
        info!("========================================");
        info!("{} stopped gracefully", config.name);
        if let Some(stats) = stats {
            info!("{}", stats);
        }
        info!("========================================");
    }

    /// Execute the binary with proper initialization and cleanup
    async fn execute(&mut self) -> anyhow::Result<()> {
        self.print_banner();
        let result = self.run().await;
        self.print_shutdown(None);
        result
    }
}

/// Manages graceful shutdown for long-running processes
#[derive(Debug, Clone)]
pub struct ShutdownManager {
    flag: Arc<AtomicBool>,
}

impl ShutdownManager {
    /// Create a new shutdown manager with running state
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Spawn a Ctrl+C signal handler that triggers shutdown
    pub fn spawn_signal_handler(&self) {
        let flag = Arc::clone(&self.flag);
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal (Ctrl+C)");
                flag.store(false, Ordering::Release);
            }
        });
    }

    pub fn is_running(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn trigger(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Sleep for a duration, but wake early if shutdown is triggered
    pub async fn interruptible_sleep(&self, duration: Duration) {
        let check_interval = Duration::from_millis(50);
        let mut elapsed = Duration::ZERO;

        while elapsed < duration && self.is_running() {
            sleep(check_interval).await;
            elapsed += check_interval;
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
