//! Reconnect delays: doubling from an initial delay up to a cap, with a little jitter so
//! a fleet of clients does not reconnect in lockstep.

use rand::Rng;
use std::time::Duration;

/// Fraction of the delay added as random jitter, at most.
const JITTER_RATIO: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
            failures: 0,
        }
    }

    /// Delay before the next attempt; doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        self.failures = self.failures.saturating_add(1);

        let jitter_ms = (base.as_millis() as f64 * JITTER_RATIO) as u64;
        if jitter_ms == 0 {
            return base;
        }
        (base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))).min(self.max)
    }

    /// Consecutive failed attempts since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }
}
