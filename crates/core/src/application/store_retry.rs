// Local retry for transient store failures
//
// Separate from job backoff: store calls are retried a small bounded number of
// times before `StoreUnavailable` reaches the caller.
use crate::application::backoff::compute_delay;
use crate::config::StoreRetryConfig;
use crate::domain::BackoffPolicy;
use crate::port::StoreResult;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential retry for store operations
#[derive(Debug, Clone)]
pub struct StoreRetryPolicy {
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl StoreRetryPolicy {
    pub fn new(config: &StoreRetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: BackoffPolicy::exponential(config.base_delay_ms, 2.0)
                .with_max_delay(config.max_delay_ms)
                .with_jitter(true),
        }
    }

    /// Run `op`, retrying `StoreError::Unavailable` up to the attempt budget
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay_ms = compute_delay(&self.backoff, attempt, &err.to_string());
                    warn!(
                        op = op_name,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay_ms,
                        error = %err,
                        "Store call failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for StoreRetryPolicy {
    fn default() -> Self {
        Self::new(&StoreRetryConfig::default())
    }
}
