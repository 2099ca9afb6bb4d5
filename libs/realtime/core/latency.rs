//! Latency sampling
//!
//! Keeps the most recent round-trip measurements so callers can report a
//! smoothed figure instead of a single noisy sample.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Number of samples retained
pub const MAX_SAMPLES: usize = 10;

/// One round-trip measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySample {
    pub timestamp: DateTime<Utc>,
    /// Milliseconds
    pub latency: u64,
}

/// Bounded FIFO of latency samples
#[derive(Debug, Default, Clone)]
pub struct LatencySampler {
    samples: VecDeque<LatencySample>,
}

impl LatencySampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a measurement, evicting the oldest once full
    pub fn record(&mut self, latency: u64) {
        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(LatencySample {
            timestamp: Utc::now(),
            latency,
        });
    }

    /// Rounded arithmetic mean, `None` when empty
    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().map(|s| s.latency).sum();
        Some((sum as f64 / self.samples.len() as f64).round() as u64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = &LatencySample> {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
