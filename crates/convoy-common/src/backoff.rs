//! Exponential retry backoff with jitter

use std::time::Duration;

/// Exponential backoff used when re-creating watchers and sessions.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Relative jitter, `0.2` spreads each delay over +/- 20%.
    pub randomization_factor: f64,
    current: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(60))
    }
}

impl RetryBackoff {
    pub fn new(initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            initial_interval,
            multiplier: 2.0,
            max_interval,
            randomization_factor: 0.2,
            current: initial_interval,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt; grows the interval for the one after.
    pub fn next_backoff(&mut self) -> Duration {
        let base = self.current.as_secs_f64();
        let delta = base * self.randomization_factor;
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * delta;
        let delay = (base + jitter).max(0.0);

        let next = (base * self.multiplier).min(self.max_interval.as_secs_f64());
        self.current = Duration::from_secs_f64(next);

        Duration::from_secs_f64(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.initial_interval;
    }
}
