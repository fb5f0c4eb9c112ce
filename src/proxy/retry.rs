use crate::policy::RetryStrategy;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempt-count retry with a fixed pause between attempts
#[derive(Debug, Clone, Copy)]
pub struct RetryExecutor {
    retry_times: u32,
    interval: Duration,
}

impl RetryExecutor {
    pub fn new(retry_times: u32, interval: Duration) -> Self {
        Self {
            retry_times,
            interval,
        }
    }

    pub fn from_strategy(strategy: &RetryStrategy) -> Self {
        Self::new(strategy.retry_times, strategy.retry_interval())
    }

    /// Total attempts this executor will make at most
    pub fn max_attempts(&self) -> u32 {
        self.retry_times + 1
    }

    /// Run `f` until it succeeds, fails with an error `should_retry` rejects,
    /// or runs out of attempts. The last error is returned.
    pub async fn execute_with_predicate<F, Fut, T, E, P>(
        &self,
        mut f: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(attempt, retry_times = self.retry_times, "Executing request");

            match f().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(attempt, "Request succeeded after retries");
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if !should_retry(&e) {
                        debug!(attempt, error = %e, "Error not retryable");
                        return Err(e);
                    }

                    if attempt > self.retry_times {
                        warn!(
                            attempt,
                            retry_times = self.retry_times,
                            error = %e,
                            "Request failed after max retries"
                        );
                        return Err(e);
                    }

                    debug!(
                        attempt,
                        wait_ms = self.interval.as_millis() as u64,
                        error = %e,
                        "Request failed, retrying after interval"
                    );
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_success_first_try() {
        let executor = RetryExecutor::new(3, Duration::from_millis(10));
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let result: Result<u32, String> = executor
            .execute_with_predicate(
                move || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok(7)
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_attempts_with_fixed_interval() {
        let executor = RetryExecutor::new(2, Duration::from_millis(100));
        let calls = Arc::new(AtomicU32::new(0));
        let start = std::time::Instant::now();

        let c = calls.clone();
        let result: Result<(), String> = executor
            .execute_with_predicate(
                move || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err("timeout".to_string())
                    }
                },
                |_| true,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(executor.max_attempts(), 3);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_non_retryable_stops() {
        let executor = RetryExecutor::new(5, Duration::from_millis(10));
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let result: Result<(), String> = executor
            .execute_with_predicate(
                move || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err("refused".to_string())
                    }
                },
                |e| e != "refused",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_from_default_strategy() {
        let executor = RetryExecutor::from_strategy(&RetryStrategy::default());
        assert_eq!(executor.max_attempts(), 1);
    }
}
