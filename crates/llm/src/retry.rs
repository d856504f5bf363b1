//! Bounded exponential backoff with jitter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use batchloom_core::{LlmRequest, LlmResponse};

use crate::client::LlmClient;
use crate::error::LlmError;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one (0 is treated as 1)
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_interval: Duration,
    /// Cap for the un-jittered delay
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Upper bound of the random extra delay, as a fraction of the base delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn exponential(max_attempts: u32, initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_interval,
            max_interval,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.max(0.0);
        self
    }

    /// Attempts actually performed.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after failed attempt `attempt` (1-indexed), before jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let initial = self.initial_interval.as_secs_f64();
        let max = self.max_interval.as_secs_f64();
        let exp = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);

        Duration::from_secs_f64((initial * exp).min(max).max(0.0))
    }

    /// Delay after failed attempt `attempt`, including random jitter in `[0, jitter * base]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        let range = base.as_secs_f64() * self.jitter;
        if range <= 0.0 {
            return base;
        }

        let extra = rand::thread_rng().gen_range(0.0..=range);
        base + Duration::from_secs_f64(extra)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy is exhausted.
///
/// Cancellation is checked before every attempt and interrupts the backoff sleep.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let attempts = policy.attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => err,
        };

        if attempt >= attempts {
            warn!(attempts, error = %err, "retries exhausted");
            return Err(LlmError::RetriesExhausted {
                attempts,
                last: Box::new(err),
            });
        }

        let wait = policy.delay_for_attempt(attempt);
        debug!(attempt, wait_ms = wait.as_millis() as u64, error = %err, "retrying after backoff");

        tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

/// Client decorator applying a [`RetryPolicy`] to every call.
pub struct RetryingClient {
    inner: Arc<dyn LlmClient>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn LlmClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl LlmClient for RetryingClient {
    async fn complete(
        &self,
        request: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        retry_with_backoff(&self.policy, cancel, || self.inner.complete(request, cancel)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::mock::MockLlmClient;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_attempts, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn base_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.base_delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..6 {
            let base = policy.base_delay_for_attempt(attempt);
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= base);
            assert!(delay <= base.mul_f64(1.2) + Duration::from_millis(1));
        }
    }

    #[tokio::test]
    async fn succeeds_after_retryable_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let cancel = CancellationToken::new();

        let result = retry_with_backoff(&fast(3), &cancel, || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(LlmError::from_status(503, "busy"))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_on_first_call() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retry_with_backoff(&fast(5), &cancel, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::from_status(400, "bad request"))
        })
        .await;

        assert!(matches!(result, Err(LlmError::Api { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_wraps_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retry_with_backoff(&fast(3), &cancel, || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(LlmError::from_status(429, format!("limited #{n}")))
        })
        .await;

        match result {
            Err(LlmError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.to_string().contains("limited #3"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelled_token_skips_the_call() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), _> = retry_with_backoff(&fast(3), &cancel, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(LlmError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff_sleep() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::exponential(3, Duration::from_secs(60), Duration::from_secs(60));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<(), _> = tokio::time::timeout(
            Duration::from_secs(5),
            retry_with_backoff(&policy, &cancel, || async move {
                Err(LlmError::from_status(502, "gateway"))
            }),
        )
        .await
        .expect("retry loop should observe cancellation");

        assert!(matches!(result, Err(LlmError::Cancelled)));
    }

    #[tokio::test]
    async fn retrying_client_recovers_from_transient_failures() {
        let inner = Arc::new(MockLlmClient::new().with_transient_failures(2));
        let client = RetryingClient::new(inner.clone(), fast(3));

        let response = client
            .complete(&LlmRequest::new("", "hello"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(inner.calls(), 3);
    }
}
