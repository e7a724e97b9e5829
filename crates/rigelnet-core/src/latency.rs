//! Round-trip latency estimation.
//!
//! Samples are collected during a receive cycle (one per first ack of a
//! reliable slot) and folded into three estimates when the cycle ends:
//!
//! - **mean**: exponentially smoothed cycle average, weight 1/8
//! - **optimistic**: minimum of the latest cycle only, so a single delayed
//!   burst is forgotten as soon as a quiet cycle follows
//! - **pessimistic**: jumps to the latest maximum and decays towards newer
//!   maxima by 1/8 per cycle, so a burst is visible at once and fades slowly
//!
//! The first cycle with samples seeds all three.

use std::time::Duration;

/// Divisor of the smoothing weight for `mean` and the decay of `pessimistic`
const SMOOTHING_DIVISOR: u32 = 8;

/// Three-way latency estimator
#[derive(Debug, Clone, Default)]
pub struct LatencyEstimator {
    mean: Duration,
    optimistic: Duration,
    pessimistic: Duration,
    cycle_samples: Vec<Duration>,
    seeded: bool,
}

impl LatencyEstimator {
    /// Create an estimator with no samples
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a round-trip sample for the current cycle
    pub fn record(&mut self, sample: Duration) {
        self.cycle_samples.push(sample);
    }

    /// Fold the current cycle's samples into the estimates.
    ///
    /// Returns `false` if the cycle had no samples, leaving the estimates
    /// untouched.
    pub fn finish_cycle(&mut self) -> bool {
        if self.cycle_samples.is_empty() {
            return false;
        }

        let count = u32::try_from(self.cycle_samples.len()).unwrap_or(u32::MAX);
        let total: Duration = self.cycle_samples.iter().sum();
        let average = total / count;
        let min = self.cycle_samples.iter().copied().min().unwrap_or(average);
        let max = self.cycle_samples.iter().copied().max().unwrap_or(average);
        self.cycle_samples.clear();

        if !self.seeded {
            self.mean = average;
            self.optimistic = min;
            self.pessimistic = max;
            self.seeded = true;
            return true;
        }

        self.mean = if average >= self.mean {
            self.mean + (average - self.mean) / SMOOTHING_DIVISOR
        } else {
            self.mean - (self.mean - average) / SMOOTHING_DIVISOR
        };
        self.optimistic = min;
        self.pessimistic = if max >= self.pessimistic {
            max
        } else {
            self.pessimistic - (self.pessimistic - max) / SMOOTHING_DIVISOR
        };
        true
    }

    /// Smoothed average latency
    #[must_use]
    pub fn mean(&self) -> Duration {
        self.mean
    }

    /// Latency of the most recent quiet round trips
    #[must_use]
    pub fn optimistic(&self) -> Duration {
        self.optimistic
    }

    /// Recent worst-case latency
    #[must_use]
    pub fn pessimistic(&self) -> Duration {
        self.pessimistic
    }

    /// Whether any sample has been folded in
    #[must_use]
    pub fn has_samples(&self) -> bool {
        self.seeded
    }

    /// Forget all samples
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
