//! Retry execution for remote API operations.
//!
//! This module provides the retry executor used by every lifecycle step:
//! - Wall-clock deadline instead of an attempt budget: a slow API burns
//!   the same budget as a flapping one
//! - Error classification: transport, rate-limit, and remote-internal
//!   errors are retried, everything else fails fast
//! - Exponential, linear, or constant backoff with a hard interval floor
//! - Jitter (full or equal) to prevent thundering herd
//! - Cooperative cancellation between attempts; in-flight calls complete
//!
//! # Example
//!
//! ```rust,ignore
//! use stratoform::retry::{BackoffStrategy, JitterStrategy, RetryPolicy};
//! use stratoform::budget::Budget;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .deadline(Duration::from_secs(120))
//!     .min_interval(Duration::from_secs(1))
//!     .backoff(BackoffStrategy::Exponential { multiplier: 2.0 })
//!     .jitter(JitterStrategy::Full)
//!     .build();
//!
//! let budget = Budget::unbounded();
//! let value = policy
//!     .execute("CreateVm", &budget, || async {
//!         // Fallible remote call here
//!         Ok(serde_json::json!({}))
//!     })
//!     .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::budget::Budget;
use crate::error::{Error, Result};

/// Backoff strategy for calculating delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant delay between attempts.
    Constant,

    /// Linear backoff: delay = min_interval * (attempt + 1)
    Linear,

    /// Exponential backoff: delay = min_interval * multiplier^attempt
    Exponential {
        /// Multiplier for exponential growth (default: 2.0)
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential { multiplier: 2.0 }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn calculate_delay(&self, attempt: u32, min_interval: Duration) -> Duration {
        let base_millis = min_interval.as_millis() as f64;

        let delay_millis = match self {
            Self::Constant => base_millis,
            Self::Linear => base_millis * (attempt as f64 + 1.0),
            Self::Exponential { multiplier } => base_millis * multiplier.powf(attempt as f64),
        };

        Duration::from_millis(delay_millis as u64)
    }
}

/// Jitter strategy for adding randomness to delays.
///
/// Jitter helps prevent the "thundering herd" problem where many clients
/// retry at exactly the same time after a shared outage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter - use exact calculated delay.
    None,

    /// Full jitter: random value between 0 and calculated delay.
    /// delay = random(0, calculated_delay)
    Full,

    /// Equal jitter: half the delay plus random jitter.
    /// delay = calculated_delay/2 + random(0, calculated_delay/2)
    Equal,
}

impl Default for JitterStrategy {
    fn default() -> Self {
        Self::Full
    }
}

impl JitterStrategy {
    /// Apply jitter to a calculated delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        let delay_millis = delay.as_millis() as f64;

        let jittered_millis = match self {
            Self::None => delay_millis,
            Self::Full => {
                if delay_millis > 0.0 {
                    rng.gen_range(0.0..delay_millis)
                } else {
                    0.0
                }
            }
            Self::Equal => {
                let half = delay_millis / 2.0;
                if half > 0.0 {
                    half + rng.gen_range(0.0..half)
                } else {
                    0.0
                }
            }
        };

        Duration::from_millis(jittered_millis.max(0.0) as u64)
    }
}

/// Predicate deciding whether an error is worth another attempt.
pub type ClassifyFn = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Retry policy for one kind of remote operation.
///
/// The budget is wall-clock time, not an attempt count: attempts continue
/// until the operation succeeds, fails terminally, or the deadline passes.
/// Policies are immutable once built and cheap to clone, so one policy is
/// shared across all operations of a kind.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum wall-clock time spent on the operation, including the
    /// attempts themselves.
    pub deadline: Duration,

    /// Minimum interval between attempts; also the backoff base. Jitter
    /// never shortens a delay below this floor.
    pub min_interval: Duration,

    /// Maximum delay between attempts (caps backoff growth).
    pub max_interval: Duration,

    /// Backoff strategy for calculating delays.
    pub backoff: BackoffStrategy,

    /// Jitter strategy for adding randomness.
    pub jitter: JitterStrategy,

    /// Custom classification; `None` falls back to [`Error::is_retryable`].
    classify: Option<ClassifyFn>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(300),
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff: BackoffStrategy::default(),
            jitter: JitterStrategy::default(),
            classify: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("deadline", &self.deadline)
            .field("min_interval", &self.min_interval)
            .field("max_interval", &self.max_interval)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("classify", &self.classify.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl RetryPolicy {
    /// Create a new retry policy builder.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Create a policy with a constant delay between attempts.
    pub fn constant(deadline: Duration, interval: Duration) -> Self {
        Self {
            deadline,
            min_interval: interval,
            max_interval: interval,
            backoff: BackoffStrategy::Constant,
            jitter: JitterStrategy::None,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff and full jitter.
    pub fn exponential(deadline: Duration, min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            deadline,
            min_interval,
            max_interval,
            backoff: BackoffStrategy::Exponential { multiplier: 2.0 },
            jitter: JitterStrategy::Full,
            ..Default::default()
        }
    }

    /// Calculate the delay before the next attempt.
    ///
    /// Backoff is capped at `max_interval`, then jittered, then clamped so
    /// the result never drops below `min_interval`. A `max_interval` below
    /// `min_interval` is treated as equal to it, so the floor always wins.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ceiling = self.max_interval.max(self.min_interval);
        let base = self.backoff.calculate_delay(attempt, self.min_interval);
        let capped = base.min(ceiling);
        self.jitter.apply(capped).clamp(self.min_interval, ceiling)
    }

    /// Check whether an error should be retried under this policy.
    pub fn should_retry(&self, error: &Error) -> bool {
        match &self.classify {
            Some(classify) => classify(error),
            None => error.is_retryable(),
        }
    }

    /// Execute an async operation with retry.
    ///
    /// The operation closure is re-invoked for each attempt. Terminal
    /// errors return immediately and unretried. Once the deadline (or the
    /// caller's tighter budget) expires, the last error is returned
    /// wrapped in [`Error::Timeout`]; the final backoff sleep is clamped
    /// so the timeout surfaces at the deadline rather than past it. A
    /// cancelled budget aborts between attempts with [`Error::Cancelled`].
    pub async fn execute<F, Fut, T>(
        &self,
        operation_label: &str,
        budget: &Budget,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let local = budget.child(self.deadline);
        let mut attempt: u32 = 0;

        loop {
            local.checkpoint()?;
            debug!(operation = operation_label, attempt = attempt + 1, "attempting operation");

            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!(
                            operation = operation_label,
                            attempts = attempt + 1,
                            "operation succeeded after retries"
                        );
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if !self.should_retry(&e) {
                        debug!(
                            operation = operation_label,
                            error = %e,
                            "terminal error, not retrying"
                        );
                        return Err(e);
                    }

                    warn!(
                        operation = operation_label,
                        attempt = attempt + 1,
                        error = %e,
                        "attempt failed, will retry"
                    );

                    if local.is_expired() {
                        return Err(Error::timeout(operation_label, start.elapsed(), Some(e)));
                    }

                    let mut delay = self.delay_for_attempt(attempt);
                    if let Some(server_delay) = e.retry_after() {
                        delay = delay.max(server_delay);
                    }

                    debug!(operation = operation_label, ?delay, "waiting before retry");
                    local.sleep(delay).await?;

                    if local.is_expired() {
                        return Err(Error::timeout(operation_label, start.elapsed(), Some(e)));
                    }

                    attempt += 1;
                }
            }
        }
    }
}

/// Builder for constructing [`RetryPolicy`] instances.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy::default(),
        }
    }

    /// Set the wall-clock deadline.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.policy.deadline = deadline;
        self
    }

    /// Set the minimum interval between attempts.
    pub fn min_interval(mut self, interval: Duration) -> Self {
        self.policy.min_interval = interval;
        self
    }

    /// Set the maximum delay between attempts.
    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.policy.max_interval = interval;
        self
    }

    /// Set the backoff strategy.
    pub fn backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.policy.backoff = strategy;
        self
    }

    /// Set the jitter strategy.
    pub fn jitter(mut self, strategy: JitterStrategy) -> Self {
        self.policy.jitter = strategy;
        self
    }

    /// Set a custom retry classification predicate.
    pub fn classify<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.policy.classify = Some(Arc::new(predicate));
        self
    }

    /// Build the [`RetryPolicy`].
    ///
    /// A `max_interval` below `min_interval` is raised to match it.
    pub fn build(self) -> RetryPolicy {
        let mut policy = self.policy;
        policy.max_interval = policy.max_interval.max(policy.min_interval);
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_constant_backoff_is_flat() {
        let strategy = BackoffStrategy::Constant;
        let base = Duration::from_secs(2);
        assert_eq!(strategy.calculate_delay(0, base), base);
        assert_eq!(strategy.calculate_delay(7, base), base);
    }

    #[test]
    fn test_linear_backoff_grows_by_base() {
        let strategy = BackoffStrategy::Linear;
        let base = Duration::from_secs(1);
        assert_eq!(strategy.calculate_delay(0, base), Duration::from_secs(1));
        assert_eq!(strategy.calculate_delay(2, base), Duration::from_secs(3));
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let strategy = BackoffStrategy::Exponential { multiplier: 2.0 };
        let base = Duration::from_secs(1);
        assert_eq!(strategy.calculate_delay(0, base), Duration::from_secs(1));
        assert_eq!(strategy.calculate_delay(3, base), Duration::from_secs(8));
    }

    #[test]
    fn test_full_jitter_stays_within_bounds() {
        let delay = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = JitterStrategy::Full.apply(delay);
            assert!(jittered <= delay);
        }
    }

    #[test]
    fn test_equal_jitter_keeps_at_least_half() {
        let delay = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = JitterStrategy::Equal.apply(delay);
            assert!(jittered >= Duration::from_secs(5));
            assert!(jittered <= delay);
        }
    }

    #[test]
    fn test_delay_never_drops_below_floor() {
        let policy = RetryPolicy::builder()
            .min_interval(Duration::from_secs(2))
            .max_interval(Duration::from_secs(30))
            .jitter(JitterStrategy::Full)
            .build();
        for attempt in 0..5 {
            assert!(policy.delay_for_attempt(attempt) >= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_builder_raises_max_interval_to_the_floor() {
        let policy = RetryPolicy::builder()
            .min_interval(Duration::from_secs(120))
            .max_interval(Duration::from_secs(60))
            .build();
        assert_eq!(policy.max_interval, Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(120));
    }

    #[test]
    fn test_misordered_intervals_pin_delays_to_the_floor() {
        // fields stay misordered here; only the delay math compensates
        let policy = RetryPolicy::exponential(
            Duration::from_secs(300),
            Duration::from_secs(120),
            Duration::from_secs(60),
        );
        for attempt in 0..4 {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::from_secs(120));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::constant(Duration::from_secs(60), Duration::from_secs(1));
        let budget = Budget::unbounded();

        let result = policy
            .execute("CreateVm", &budget, || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Error::transport("CreateVm", "connection reset"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::constant(Duration::from_secs(60), Duration::from_secs(1));
        let budget = Budget::unbounded();

        let result: Result<()> = policy
            .execute("CreateVm", &budget, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::invalid_request("CreateVm", "bad image id"))
            })
            .await;

        assert!(matches!(result, Err(Error::InvalidRequest { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_wraps_last_error_in_timeout() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::constant(Duration::from_secs(5), Duration::from_secs(2));
        let budget = Budget::unbounded();
        let start = Instant::now();

        let result: Result<()> = policy
            .execute("DeleteVm", &budget, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::remote_internal("DeleteVm", "500", "still busy"))
            })
            .await;

        // Attempts at t=0, t=2, t=4; the final sleep is clamped to the
        // deadline so the timeout fires at t=5.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        match result {
            Err(Error::Timeout { operation, source, .. }) => {
                assert_eq!(operation, "DeleteVm");
                assert!(matches!(*source.unwrap(), Error::RemoteInternal { .. }));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_retries() {
        let token = tokio_util::sync::CancellationToken::new();
        let budget = Budget::new(token.clone());
        let policy = RetryPolicy::constant(Duration::from_secs(600), Duration::from_secs(10));
        let attempts = Arc::new(AtomicU32::new(0));

        let task_attempts = Arc::clone(&attempts);
        let handle = tokio::spawn(async move {
            policy
                .execute("ReadVms", &budget, move || {
                    let task_attempts = Arc::clone(&task_attempts);
                    async move {
                        task_attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(Error::transport("ReadVms", "unreachable"))
                    }
                })
                .await
        });

        tokio::time::sleep(Duration::from_secs(3)).await;
        token.cancel();
        let result = handle.await.unwrap();

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_retry_after_stretches_the_delay() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::constant(Duration::from_secs(120), Duration::from_secs(1));
        let budget = Budget::unbounded();
        let start = Instant::now();

        let result = policy
            .execute("CreatePublicIp", &budget, || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(Error::rate_limited(
                        "CreatePublicIp",
                        Some(Duration::from_secs(15)),
                    ))
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_custom_classification_overrides_default() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::builder()
            .deadline(Duration::from_secs(60))
            .min_interval(Duration::from_millis(1))
            .jitter(JitterStrategy::None)
            .classify(|_| false)
            .build();
        let budget = Budget::unbounded();

        let result: Result<()> = policy
            .execute("ReadImages", &budget, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::transport("ReadImages", "reset"))
            })
            .await;

        // Transport errors retry by default; the custom predicate vetoes.
        assert!(matches!(result, Err(Error::Transport { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
