//! Bounded retry for message processing.
//!
//! Pure control flow with no knowledge of payload semantics: attempt an
//! async operation up to a caller-supplied number of times with a fixed
//! wait between attempts, stopping on the first success.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Caller-supplied retry bounds. There is no default; both values are part
/// of the consumer's contract and must be chosen explicitly.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub attempts: u32,
    /// Fixed wait between consecutive attempts
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

/// Retry a fallible async operation under a fixed-interval policy.
///
/// Returns the first success, or the last error once all attempts are
/// spent. An `attempts` of zero still runs the operation once.
///
/// # Example
/// ```rust
/// use jetstream_events::{retry_with_policy, RetryPolicy};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), String> {
/// let policy = RetryPolicy::new(3, Duration::from_millis(100));
/// let value = retry_with_policy(|| async { Ok::<_, String>(42) }, &policy, "example").await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_policy<F, Fut, T, E>(
    operation: F,
    policy: &RetryPolicy,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        context = %context,
                        attempt = attempt,
                        "operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if attempt >= max_attempts {
                    warn!(
                        context = %context,
                        attempts = attempt,
                        error = %err,
                        "operation failed after all attempts"
                    );
                    return Err(err);
                }

                warn!(
                    context = %context,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    interval_ms = policy.interval.as_millis() as u64,
                    error = %err,
                    "operation failed, retrying"
                );

                sleep(policy.interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let result = retry_with_policy(|| async { Ok::<_, String>(42) }, &policy, "test").await;

        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let attempts = Arc::new(Mutex::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_policy(
            || {
                let attempts = attempts_clone.clone();
                async move {
                    let mut count = attempts.lock().unwrap();
                    *count += 1;
                    if *count < 3 {
                        Err(format!("attempt {}", *count))
                    } else {
                        Ok(42)
                    }
                }
            },
            &policy,
            "test",
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(*attempts.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn fails_after_all_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let attempts = Arc::new(Mutex::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_policy(
            || {
                let attempts = attempts_clone.clone();
                async move {
                    *attempts.lock().unwrap() += 1;
                    Err::<i32, _>("persistent error")
                }
            },
            &policy,
            "test",
        )
        .await;

        assert_eq!(result, Err("persistent error"));
        assert_eq!(*attempts.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn waits_a_fixed_interval_between_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));

        let start = std::time::Instant::now();
        let result =
            retry_with_policy(|| async { Err::<i32, _>("error") }, &policy, "test").await;
        let elapsed = start.elapsed();

        assert!(result.is_err());
        // two waits between three attempts
        assert!(elapsed >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy::new(0, Duration::from_millis(1));
        let attempts = Arc::new(Mutex::new(0));
        let attempts_clone = attempts.clone();

        let _ = retry_with_policy(
            || {
                let attempts = attempts_clone.clone();
                async move {
                    *attempts.lock().unwrap() += 1;
                    Err::<i32, _>("error")
                }
            },
            &policy,
            "test",
        )
        .await;

        assert_eq!(*attempts.lock().unwrap(), 1);
    }
}
