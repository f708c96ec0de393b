//! Retry-with-constant-backoff, shared by every fetch path.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempt budget, including the first try. Values below 1 are treated as 1.
    pub attempts: u32,
    /// Constant pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

/// Final result of a retried operation and how many attempts it took.
#[derive(Debug)]
pub struct Retried<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Runs `op` until it succeeds, fails with an error `is_retryable` rejects, or the
/// attempt budget is spent. `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    is_retryable: P,
    mut op: F,
) -> Retried<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let budget = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(e) if attempt < budget && is_retryable(&e) => {
                debug!(
                    attempt,
                    budget,
                    backoff_ms = policy.backoff.as_millis() as u64,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
            Err(e) => {
                return Retried {
                    result: Err(e),
                    attempts: attempt,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn instant(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn stops_after_budget_on_retryable_errors() {
        let calls = Cell::new(0);
        let out: Retried<(), &str> = retry_with_backoff(&instant(3), |_| true, |_| {
            calls.set(calls.get() + 1);
            async { Err("down") }
        })
        .await;
        assert_eq!(calls.get(), 3);
        assert_eq!(out.attempts, 3);
        assert!(out.result.is_err());
    }

    #[tokio::test]
    async fn terminal_error_is_not_retried() {
        let calls = Cell::new(0);
        let out: Retried<(), &str> = retry_with_backoff(&instant(5), |_| false, |_| {
            calls.set(calls.get() + 1);
            async { Err("bad bytes") }
        })
        .await;
        assert_eq!(calls.get(), 1);
        assert_eq!(out.attempts, 1);
    }

    #[tokio::test]
    async fn succeeds_on_later_attempt() {
        let flaky = |attempt: u32| async move {
            if attempt < 2 {
                Err("flaky")
            } else {
                Ok(attempt)
            }
        };
        let out: Retried<u32, &str> = retry_with_backoff(&instant(3), |_| true, flaky).await;
        assert_eq!(out.result.unwrap(), 2);
        assert_eq!(out.attempts, 2);
    }

    #[tokio::test]
    async fn zero_budget_still_tries_once() {
        let calls = Cell::new(0);
        let _: Retried<(), &str> = retry_with_backoff(&instant(0), |_| true, |_| {
            calls.set(calls.get() + 1);
            async { Err("down") }
        })
        .await;
        assert_eq!(calls.get(), 1);
    }
}
