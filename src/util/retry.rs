use rand::Rng;
use std::time::Duration;

/// Exponential backoff between attempts at a flaky remote call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` means a single attempt.
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn total_attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Delay before retry number `attempt + 1`, without jitter.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let delay_ms =
            (self.initial_delay.as_millis() as f64) * self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Backoff delay with random jitter: somewhere between half and all of
    /// [`delay_for_attempt`](Self::delay_for_attempt).
    pub fn jittered_delay(&self, attempt: usize) -> Duration {
        let full = self.delay_for_attempt(attempt).as_millis() as u64;
        if full < 2 {
            return Duration::from_millis(full);
        }
        let ms = rand::thread_rng().gen_range(full / 2..=full);
        Duration::from_millis(ms)
    }
}
