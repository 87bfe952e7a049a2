//! Transaction retry policy
//!
//! Every mutating store transaction the worker runs is wrapped in a bounded
//! retry loop. The default matches the protocol's contract: ten attempts with
//! immediate rescheduling. Deployments contending on a busy store can opt
//! into fixed or exponential backoff with jitter through
//! [`QueueOptions::with_backoff`](crate::QueueOptions::with_backoff).

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Bounded retry policy for store transactions
///
/// # Example
///
/// ```
/// use arbor_queue::TxnRetry;
/// use std::time::Duration;
///
/// let policy = TxnRetry::exponential(Duration::from_millis(50))
///     .with_max_attempts(8)
///     .with_jitter(0.1);
///
/// assert_eq!(policy.max_attempts, 8);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TxnRetry {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Cap on the delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (1.0 for fixed intervals)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,
}

impl Default for TxnRetry {
    fn default() -> Self {
        Self::immediate()
    }
}

impl TxnRetry {
    /// Ten attempts with immediate rescheduling between them
    pub fn immediate() -> Self {
        Self {
            max_attempts: 10,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Fixed delay between attempts
    pub fn fixed(interval: Duration) -> Self {
        Self {
            max_attempts: 10,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Exponential backoff starting at `initial`, doubling per retry
    pub fn exponential(initial: Duration) -> Self {
        Self {
            max_attempts: 10,
            initial_interval: initial,
            max_interval: initial * 64,
            backoff_coefficient: 2.0,
            jitter: 0.0,
        }
    }

    /// Set the maximum number of attempts (at least one)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the cap on the delay between retries
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before retrying after the given 1-based attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt < 1 || self.initial_interval.is_zero() {
            return Duration::ZERO;
        }

        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(attempt as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
