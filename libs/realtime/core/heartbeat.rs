//! Heartbeat mechanism
//!
//! # Architecture
//!
//! Each open connection runs a dedicated ticker task:
//!
//! ```text
//! ┌─────────────────────┐
//! │  Ticker Task        │
//! │  (Tokio spawn)      │
//! │                     │
//! │  Every interval:    │
//! │  1. Wait for tick   │
//! │  2. Send ping ──────┼──> adapter outbound path ──> server
//! │  3. Arm timeout     │
//! └─────────────────────┘
//!            │
//!            └── pong (same correlation id) ──> PendingPings::resolve ──> latency
//! ```
//!
//! A ping's send timestamp doubles as its correlation id. An entry still
//! pending when its timeout fires marks the connection dead.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Pings awaiting their pong, keyed by correlation id
#[derive(Debug, Default)]
pub struct PendingPings {
    sent: HashMap<i64, Instant>,
}

impl PendingPings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a ping sent now; returns the correlation id it was filed under
    ///
    /// Ids are unique among pending pings: a clash with one sent in the same
    /// millisecond moves the new ping to the next free id.
    pub fn record(&mut self, mut correlation: i64) -> i64 {
        while self.sent.contains_key(&correlation) {
            correlation += 1;
        }
        self.sent.insert(correlation, Instant::now());
        correlation
    }

    /// Forget pings pending for longer than `max_age`; returns how many
    pub fn prune(&mut self, max_age: Duration) -> usize {
        let before = self.sent.len();
        self.sent.retain(|_, sent| sent.elapsed() <= max_age);
        before - self.sent.len()
    }

    /// Match a pong; returns the round trip if the ping was pending
    pub fn resolve(&mut self, correlation: i64) -> Option<Duration> {
        self.sent.remove(&correlation).map(|sent| sent.elapsed())
    }

    /// Drop a ping whose timeout fired; true if it was still unanswered
    pub fn expire(&mut self, correlation: i64) -> bool {
        self.sent.remove(&correlation).is_some()
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }

    pub fn clear(&mut self) {
        self.sent.clear();
    }
}

/// Spawn a task that calls `on_tick` every `period`
///
/// The first tick fires one full period after spawning. Missed ticks are
/// skipped rather than bursted. The task ends once `target` is dropped.
pub(crate) fn spawn_ticker<T, F>(period: Duration, target: Weak<T>, on_tick: F) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the first immediate tick - wait for the first interval
        ticker.tick().await;

        debug!("Ticker started with period: {:?}", period);

        loop {
            ticker.tick().await;
            match target.upgrade() {
                Some(target) => on_tick(target),
                None => break,
            }
        }

        debug!("Ticker exiting");
    })
}
