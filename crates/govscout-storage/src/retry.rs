use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use govscout_core::BackoffPolicy;
use tracing::warn;

use crate::FetchError;

/// Retry policy shared by every upstream caller: listing pages, historical
/// award queries and analysis calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self { backoff }
    }

    /// Retry immediately, for tests and fixture runs.
    pub fn immediate(max_retries: usize) -> Self {
        Self::new(BackoffPolicy::no_delay(max_retries))
    }

    pub fn allows_retry(&self, attempt_index: usize) -> bool {
        attempt_index < self.backoff.max_retries
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        self.backoff.delay_for_attempt(attempt_index)
    }

    pub async fn run<T, E, F, Fut, P>(&self, label: &str, mut op: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0usize;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_retryable(&err) && self.allows_retry(attempt) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        label,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn run_fetch<T, F, Fut>(&self, label: &str, op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        self.run(label, op, FetchError::is_transient).await
    }
}
