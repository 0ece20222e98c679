//! Exponential backoff with jitter.
//!
//! One policy shape, instantiated independently per use site so that
//! failure domains stay isolated: the firehose reconnect loop, the
//! directory lookup path and the database flush path each own their
//! own [`Backoff`] counter.

use rand::Rng;
use std::time::Duration;

/// Parameters for an exponential backoff schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Ceiling for the exponential growth.
    pub cap: Duration,
    /// Upper bound of the random extra delay added to each step.
    pub jitter: Duration,
    /// Maximum number of retries, `None` retries indefinitely.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, jitter: Duration::ZERO, max_attempts: None }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// The delay for the given zero-based attempt number:
    /// `min(base * 2^attempt, cap)` plus a uniform random amount in
    /// `[0, jitter]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.cap);
        if self.jitter.is_zero() {
            delay
        } else {
            delay + rand::thread_rng().gen_range(Duration::ZERO..=self.jitter)
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff { policy: self.clone(), attempt: 0 }
    }
}

/// A single instantiation of a [`RetryPolicy`] with its own attempt
/// counter.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// The delay to wait before the next retry, or `None` once the
    /// attempt budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Number of retries taken since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Forget accumulated failures, e.g. after a sustained healthy
    /// connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
