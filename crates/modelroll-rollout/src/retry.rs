//! Bounded retries with exponential backoff.
//!
//! Every attempt is bounded by a per-call timeout; an expired attempt
//! counts as a failure. The delay doubles after each failure up to a cap.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use modelroll_core::{duration_ms, ActuatorPolicy};

/// Attempt budget and timing for one retried operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub call_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl From<&ActuatorPolicy> for RetryPolicy {
    fn from(p: &ActuatorPolicy) -> Self {
        Self {
            max_attempts: p.max_attempts,
            call_timeout: p.call_timeout,
            backoff_base: p.backoff_base,
            backoff_max: p.backoff_max,
        }
    }
}

/// Doubling delay sequence: base, 2*base, 4*base, ... capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            max,
            current: base.min(max),
        }
    }

    /// Delay before the next attempt; doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

/// Why a single attempt failed.
#[derive(Debug, Error)]
pub enum AttemptError<E> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("{0}")]
    Failed(E),
}

/// All attempts failed.
#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempts: {last}")]
pub struct RetryExhausted<E> {
    pub operation: &'static str,
    pub attempts: u32,
    pub last: AttemptError<E>,
}

/// Run `call` until it succeeds or the attempt budget is spent.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, RetryExhausted<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut backoff = Backoff::new(policy.backoff_base, policy.backoff_max);
    let mut attempt = 1;

    loop {
        let error = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(e)) => AttemptError::Failed(e),
            Err(_) => AttemptError::TimedOut(policy.call_timeout),
        };

        if attempt >= attempts {
            return Err(RetryExhausted {
                operation,
                attempts: attempt,
                last: error,
            });
        }

        let delay = backoff.next_delay();
        warn!(
            operation,
            attempt,
            max_attempts = attempts,
            error = %error,
            retry_in_ms = duration_ms(delay),
            "attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            call_timeout: Duration::from_secs(1),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(500),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<u64> = (0..5).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let mut b = Backoff::new(Duration::MAX, Duration::MAX);
        assert_eq!(b.next_delay(), Duration::MAX);
        assert_eq!(b.next_delay(), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&policy(5), "op", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 { Err("flaky") } else { Ok(n) }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempt_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&policy(5), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down")
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 5);
        assert!(matches!(err.last, AttemptError::Failed("down")));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_counts_as_timeout() {
        let result: Result<(), RetryExhausted<&str>> =
            retry_with_backoff(&policy(2), "op", || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 2);
        assert!(matches!(err.last, AttemptError::TimedOut(_)));
    }
}
