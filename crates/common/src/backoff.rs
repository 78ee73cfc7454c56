use std::time::Duration;

use rand::Rng;

/// Doubling is clamped at this many steps; past that the cap applies
/// anyway.
const MAX_DOUBLINGS: u32 = 16;

/// A jittered, capped delay sequence for retry loops such as the SMPC
/// result poll.
///
/// Each failure doubles the delay up to the cap. Half of the current
/// delay is kept as a floor and the other half is randomized, so
/// concurrent loops spread out instead of hammering a recovering service
/// in lock step, while a poll never fires again immediately.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// How long to wait before the next attempt.
    pub fn next_delay(&mut self, rng: &mut impl Rng) -> Duration {
        let doublings = self.attempt.min(MAX_DOUBLINGS);
        self.attempt = self.attempt.saturating_add(1);
        let uncapped = self
            .base
            .saturating_mul(1u32 << doublings)
            .min(self.cap);
        let half = uncapped / 2;
        half + half.mul_f64(rng.random::<f64>())
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Start the sequence over after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
