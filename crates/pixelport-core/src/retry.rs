//! Bounded retry with exponential backoff and deterministic jitter.
//!
//! Retries are an explicit attempt counter against a policy ceiling, never
//! recursion. Jitter is derived from the job id and attempt number so a
//! replayed attempt sleeps the same amount - no randomness source needed.

use std::time::Duration;

use sha2::{Digest, Sha256};

/// Bounded retry policy for provider calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempt ceiling per stage (first try included).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Cap on the exponential delay.
    pub max_delay: Duration,
    /// Upper bound on the additive jitter.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempts` have run.
    pub fn attempts_remaining(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the next attempt.
    ///
    /// A provider-suggested delay is honored verbatim when present.
    /// Otherwise: exponential from `base_delay`, capped at `max_delay`,
    /// plus jitter keyed on (`key`, `attempt`).
    pub fn delay_for(&self, key: &str, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(suggested) = suggested {
            return suggested;
        }

        let shift = attempt.saturating_sub(1).min(16);
        let exponential = self
            .base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay);

        exponential + jitter(key, attempt, self.max_jitter)
    }
}

/// Deterministic jitter in `[0, max)` derived from the key and attempt.
fn jitter(key: &str, attempt: u32, max: Duration) -> Duration {
    let max_millis = max.as_millis() as u64;
    if max_millis == 0 {
        return Duration::ZERO;
    }

    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(attempt.to_le_bytes());
    let digest = hasher.finalize();
    let raw = u64::from_le_bytes(
        digest.as_slice()[..8]
            .try_into()
            .expect("digest is long enough"),
    );
    Duration::from_millis(raw % max_millis)
}
