use rand::Rng;
use std::time::Duration;

/// Trait for defining reconnection strategies
///
/// Implement this trait to control how an adapter behaves when its
/// connection is lost.
pub trait ReconnectionStrategy: Send + Sync {
    /// Get the delay before a reconnection attempt
    ///
    /// # Arguments
    /// * `attempt` - The reconnection attempt number (1-based)
    ///
    /// # Returns
    /// * `Some(duration)` - Wait this long before reconnecting
    /// * `None` - Stop reconnecting
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Check if another attempt may follow `attempts_made` failed ones
    fn should_reconnect(&self, attempts_made: u32) -> bool;
}

/// Exponential backoff with positive jitter
///
/// `base = min(initial_delay * 2^(attempt-1), max_delay)` and the delay is
/// `round(base + base * jitter_factor * r)` with `r` uniform in `[0, 1)`,
/// so it always lies in `[base, base * (1 + jitter_factor)]`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    max_attempts: Option<u32>,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff strategy
    ///
    /// # Arguments
    /// * `initial_delay` - The delay before the first reconnect
    /// * `max_delay` - Upper bound for the base delay
    /// * `max_attempts` - Maximum number of attempts (None = unlimited)
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            initial_delay,
            max_delay,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    /// Set the jitter factor (negative values are treated as 0)
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.max(0.0);
        self
    }

    /// Base delay for `attempt`, before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let base = self.initial_delay.as_millis() as f64 * 2f64.powi(exponent as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay for `attempt` with an explicit random draw in `[0, 1)`
    pub fn delay_with(&self, attempt: u32, random: f64) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let delay = base + base * self.jitter_factor * random.clamp(0.0, 1.0);
        Duration::from_millis(delay.round() as u64)
    }
}

impl ReconnectionStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_reconnect(attempt.saturating_sub(1)) {
            return None;
        }
        let random: f64 = rand::thread_rng().gen();
        Some(self.delay_with(attempt, random))
    }

    fn should_reconnect(&self, attempts_made: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts_made < max)
    }
}
