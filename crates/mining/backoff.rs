use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter, shared by the calibration descent, chest
/// waits, and job requeues.
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

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The delay for the next retry: `base * 2^n`, capped, with up to 25%
    /// random jitter so stacked agents do not retry in lockstep.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0.0..=0.25);
        capped.mul_f64(1.0 + jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
