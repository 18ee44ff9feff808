use std::time::Duration;

use polybook_metadata::BackoffConfig;

/// Exponential reconnect backoff with optional jitter. Retries never run
/// out; the delay just stops growing at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, factor: f64, jitter: f64) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            factor: factor.max(1.0),
            jitter: if jitter.is_nan() {
                0.0
            } else {
                jitter.clamp(0.0, 1.0)
            },
            current: initial,
            attempts: 0,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_ms),
            Duration::from_millis(config.max_ms),
            config.factor,
            config.jitter,
        )
    }

    /// Delay before the next attempt. Never exceeds `max`.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.attempts = self.attempts.saturating_add(1);
        self.current = if base >= self.max {
            self.max
        } else {
            scale(base, self.factor, self.max)
        };

        let jitter = if self.jitter > 0.0 {
            scale(base, rand::random::<f64>() * self.jitter, self.max)
        } else {
            Duration::ZERO
        };
        base.saturating_add(jitter).min(self.max)
    }

    /// Called after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// `d * by`, capped. Products that overflow `Duration` land on the cap.
fn scale(d: Duration, by: f64, cap: Duration) -> Duration {
    Duration::try_from_secs_f64(d.as_secs_f64() * by)
        .unwrap_or(cap)
        .min(cap)
}
