//! Runs a unit of async work under a [`RetryPolicy`], racing each attempt's
//! backoff delay against a [`CancellationToken`].

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::retry::RetryPolicy;

/// Whether a failed attempt is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Try again, subject to the remaining attempt budget.
    Transient,
    /// Give up immediately.
    Fatal,
}

/// Outcome of [`execute`].
#[derive(Debug, Clone)]
pub struct OperationResult<T, E> {
    /// The final value, if the operation eventually succeeded.
    pub value: Option<T>,
    /// The final error, if every attempt failed (or the last one was fatal).
    pub error: Option<E>,
    /// Total wall-clock time spent, including backoff delays.
    pub duration: Duration,
    /// Number of attempts actually made.
    pub attempts: u32,
    /// Whether cancellation was observed while sleeping between attempts.
    pub cancelled_during_delay: bool,
}

impl<T, E> OperationResult<T, E> {
    /// True if the operation produced a value.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.value.is_some()
    }
}

/// Run `work` under `policy`, retrying transient failures with backoff until
/// the attempt budget is exhausted, a fatal error is classified, or `cancel`
/// fires.
///
/// `work` is called once per attempt; `classify` inspects a failure and
/// decides whether it is worth retrying.
pub async fn execute<T, E, Fut, W, C>(
    mut work: W,
    policy: &RetryPolicy,
    classify: C,
    cancel: &CancellationToken,
) -> OperationResult<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    W: FnMut() -> Fut,
    C: Fn(&E) -> Classification,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        if cancel.is_cancelled() {
            return OperationResult {
                value: None,
                error: None,
                duration: started.elapsed(),
                attempts: attempt - 1,
                cancelled_during_delay: false,
            };
        }

        match work().await {
            Ok(value) => {
                return OperationResult {
                    value: Some(value),
                    error: None,
                    duration: started.elapsed(),
                    attempts: attempt,
                    cancelled_during_delay: false,
                };
            }
            Err(error) => {
                let give_up = attempt >= policy.max_attempts
                    || classify(&error) == Classification::Fatal;
                if give_up {
                    return OperationResult {
                        value: None,
                        error: Some(error),
                        duration: started.elapsed(),
                        attempts: attempt,
                        cancelled_during_delay: false,
                    };
                }

                let delay = jittered_delay(policy, attempt - 1);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => {
                        return OperationResult {
                            value: None,
                            error: Some(error),
                            duration: started.elapsed(),
                            attempts: attempt,
                            cancelled_during_delay: true,
                        };
                    }
                }
            }
        }
    }
}

fn jittered_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.base_delay_for_attempt(attempt);
    if policy.jitter_factor <= 0.0 {
        return base;
    }
    let base_secs = base.as_secs_f64();
    let jitter = base_secs * policy.jitter_factor;
    let offset = rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_secs_f64((base_secs + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryStrategy;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            strategy: RetryStrategy::Fixed,
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn succeeds_first_try_without_retrying() {
        let calls = AtomicU32::new(0);
        let result = execute(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, &str>(42) }
            },
            &fast_policy(3),
            |_: &&str| Classification::Transient,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(result.value, Some(42));
        assert_eq!(result.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures_until_budget_exhausted() {
        let calls = AtomicU32::new(0);
        let result = execute(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<u32, _>("timeout") }
            },
            &fast_policy(3),
            |_: &&str| Classification::Transient,
            &CancellationToken::new(),
        )
        .await;
        assert!(!result.is_ok());
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result = execute(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<u32, _>("bad_request") }
            },
            &fast_policy(5),
            |_: &&str| Classification::Fatal,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(result.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_between_attempts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = execute(
            || async { Err::<u32, _>("timeout") },
            &fast_policy(5),
            |_: &&str| Classification::Transient,
            &cancel,
        )
        .await;
        assert!(!result.is_ok());
        assert_eq!(result.attempts, 0);
    }
}
