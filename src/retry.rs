use std::future::Future;

use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const MAX_BACKOFF_SHIFT: u32 = 16;

/// Marker produced when the surrounding request goes away mid-backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// `2^attempt * base_delay`, attempt counted from zero.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_BACKOFF_SHIFT);
        self.base_delay.saturating_mul(factor)
    }
}

/// Runs `operation` until it succeeds or `max_retries` retries are spent.
///
/// The last error is returned as-is. Backoff waits are async sleeps raced
/// against `cancel`; a cancelled token ends the loop without another attempt.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<Cancelled> + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("Operation succeeded after {attempt} retries");
                }
                return Ok(value);
            }
            Err(error) if attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "Attempt {} of {} failed: {error}. Retrying in {:?}",
                    attempt + 1,
                    policy.max_retries + 1,
                    delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Cancelled.into()),
                    _ = sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Failed(u32),
        Cancelled,
    }

    impl From<Cancelled> for TestError {
        fn from(_: Cancelled) -> Self {
            Self::Cancelled
        }
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (0..3).map(|attempt| policy.delay_for(attempt)).collect();
        assert_eq!(
            delays,
            [
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(delays.iter().sum::<Duration>(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn always_failing_operation_runs_max_retries_plus_one() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result: Result<(), TestError> = run_with_retry(fast_policy(3), &cancel, || {
            let attempts = Arc::clone(&attempts);
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Failed(n))
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(result, Err(TestError::Failed(3)));
    }

    #[tokio::test]
    async fn stops_after_first_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result = run_with_retry(fast_policy(3), &cancel, || {
            let attempts = Arc::clone(&attempts);
            async move {
                match attempts.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(TestError::Failed(0)),
                    n => Ok(n),
                }
            }
        })
        .await;

        assert_eq!(result, Ok(1));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result: Result<(), TestError> = run_with_retry(fast_policy(0), &cancel, || {
            let attempts = Arc::clone(&attempts);
            async move { Err(TestError::Failed(attempts.fetch_add(1, Ordering::SeqCst))) }
        })
        .await;

        assert_eq!(result, Err(TestError::Failed(0)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_stops_retrying() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(30),
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<(), TestError> = tokio::time::timeout(
            Duration::from_secs(5),
            run_with_retry(policy, &cancel, || {
                let attempts = Arc::clone(&attempts);
                async move { Err(TestError::Failed(attempts.fetch_add(1, Ordering::SeqCst))) }
            }),
        )
        .await
        .expect("backoff should end on cancellation");

        assert_eq!(result, Err(TestError::Cancelled));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_does_not_block_other_tasks() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(200),
        };

        let retrying = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                run_with_retry::<(), _, _, _>(policy, &cancel, || async {
                    Err(TestError::Failed(0))
                })
                .await
            }
        });

        let quick = tokio::time::timeout(Duration::from_millis(100), async { 42 }).await;
        assert_eq!(quick, Ok(42));
        assert!(!retrying.is_finished());
        assert_eq!(retrying.await.unwrap(), Err(TestError::Failed(0)));
    }
}
