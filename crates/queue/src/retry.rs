//! Retry policy for failed dispatches
//!
//! Two backoff variants exist. The primary variant releases the lock so the
//! job is immediately re-acquirable; contention is bounded by the worker's own
//! empty-cycle backoff. The deferred variant stamps `next_retry_at` on the row
//! and hides it from candidate selection until that time passes, which is what
//! outbound publication retries use.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a retryable failure is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BackoffMode {
    /// Release the lock; any worker may pick the job up right away
    Immediate,

    /// Exclude the row from selection until `base * 2^retry_count`, capped
    Deferred {
        #[serde(with = "duration_millis")]
        base: Duration,
        #[serde(with = "duration_millis")]
        max: Duration,
    },
}

/// Configuration for job retries
///
/// # Example
///
/// ```
/// use conveyor_queue::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::deferred(Duration::from_secs(30), Duration::from_secs(3600))
///     .with_max_retries(4);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures after which the job becomes terminal
    pub max_retries: u32,

    /// Scheduling of retryable failures
    pub backoff: BackoffMode,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}

impl RetryPolicy {
    /// Immediate-requeue policy with the default retry ceiling
    pub fn immediate() -> Self {
        Self {
            max_retries: 2,
            backoff: BackoffMode::Immediate,
        }
    }

    /// Deferred exponential-backoff policy
    pub fn deferred(base: Duration, max: Duration) -> Self {
        Self {
            max_retries: 2,
            backoff: BackoffMode::Deferred { base, max },
        }
    }

    /// Set the retry ceiling
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether a job with this many recorded failures is terminal
    ///
    /// `retry_count` is the count after the current failure has been added,
    /// so with `max_retries = 2` the second failure is terminal.
    pub fn is_terminal(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }

    /// When the row becomes selectable again, if the backoff is deferred
    ///
    /// `retry_count` is the count before the increment for the current
    /// failure, matching `min(base * 2^retry_count, max)`.
    pub fn next_retry_at(&self, now: DateTime<Utc>, retry_count: u32) -> Option<DateTime<Utc>> {
        match self.backoff {
            BackoffMode::Immediate => None,
            BackoffMode::Deferred { base, max } => {
                let factor = 2f64.powi(retry_count.min(31) as i32);
                let delay = Duration::from_secs_f64(base.as_secs_f64() * factor).min(max);
                Some(now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX))
            }
        }
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
