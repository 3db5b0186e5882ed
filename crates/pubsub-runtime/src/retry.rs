//! # Retry Module
//!
//! Exponential backoff retry around a single provider operation.
//!
//! [`call`] is a pure decorator: it keeps no state between invocations and
//! decides whether to retry using a predicate supplied by the provider driver
//! and the caller's cancellation token.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Retry policy configuration for exponential backoff
///
/// # Examples
///
/// ```rust
/// use pubsub_runtime::retry::RetryPolicy;
/// use std::time::Duration;
///
/// // Default policy: unlimited attempts, 1s initial, 30s max, 2.0x multiplier
/// let policy = RetryPolicy::default();
/// assert!(policy.max_attempts.is_none());
///
/// // Custom policy
/// let policy = RetryPolicy::new(Some(3), Duration::from_millis(50), Duration::from_secs(1), 1.5);
/// assert_eq!(policy.max_attempts, Some(3));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt; `None` retries for
    /// as long as the error stays retryable and the caller is not cancelled
    pub max_attempts: Option<u32>,

    /// Initial delay before first retry
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Exponential backoff multiplier (typically 2.0)
    pub backoff_multiplier: f64,

    /// Whether to add jitter to delays
    pub use_jitter: bool,

    /// Jitter range as a fraction of the delay (0.25 = ±25%)
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: true,
            jitter_percent: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(
        max_attempts: Option<u32>,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
            use_jitter: true,
            jitter_percent: 0.25,
        }
    }

    /// Disable jitter (deterministic delays, mostly useful in tests)
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Set custom jitter percentage (0.0 to 1.0)
    pub fn with_jitter_percent(mut self, percent: f64) -> Self {
        self.jitter_percent = percent.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a specific retry attempt
    ///
    /// Uses exponential backoff formula: delay = initial * multiplier^attempt,
    /// capped at `max_delay`, with jitter applied when enabled.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped_delay_secs = base_delay_secs.min(self.max_delay.as_secs_f64());

        let final_delay_secs = if self.use_jitter {
            Self::add_jitter(capped_delay_secs, self.jitter_percent)
        } else {
            capped_delay_secs
        };

        Duration::from_secs_f64(final_delay_secs)
    }

    /// Check if we should retry for this attempt number (0-based)
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }

    /// Applies random variation in range [delay * (1-jitter), delay * (1+jitter)]
    fn add_jitter(delay_secs: f64, jitter_percent: f64) -> f64 {
        let jitter_range = delay_secs * jitter_percent;
        if jitter_range <= 0.0 {
            return delay_secs;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(-jitter_range..=jitter_range);
        (delay_secs + jitter).max(0.0)
    }
}

/// State tracker for one retried call
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Current retry attempt (0-based)
    pub attempt: u32,

    /// Total invocations made so far
    pub total_attempts: u32,
}

impl RetryState {
    /// Create new retry state before the first invocation
    pub fn new() -> Self {
        Self::default()
    }

    /// Get next delay from policy
    pub fn get_delay(&self, policy: &RetryPolicy) -> Duration {
        policy.calculate_delay(self.attempt)
    }

    /// Check if we can retry with this policy
    pub fn can_retry(&self, policy: &RetryPolicy) -> bool {
        policy.should_retry(self.attempt)
    }
}

/// Run `operation`, retrying with backoff while `is_retryable` approves the
/// error and `cancel` has not fired.
///
/// The last error is returned unmodified when retrying stops, including when
/// the token fires during a backoff pause.
pub async fn call<T, E, Op, Fut, P>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    is_retryable: P,
    mut operation: Op,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: fmt::Display,
{
    let mut state = RetryState::new();
    loop {
        state.total_attempts += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if cancel.is_cancelled() || !is_retryable(&err) || !state.can_retry(policy) {
            return Err(err);
        }

        let delay = state.get_delay(policy);
        warn!(
            attempt = state.total_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Retryable provider failure, backing off"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(err),
            _ = tokio::time::sleep(delay) => {}
        }
        state.attempt += 1;
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
