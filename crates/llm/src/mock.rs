//! Deterministic in-process provider clients for tests and local runs.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use batchloom_core::{BatchJobId, BatchState, BatchStatus, LlmRequest, LlmResponse, TokenUsage};

use crate::client::{BatchClient, LlmClient};
use crate::error::LlmError;

fn echo(request: &LlmRequest) -> LlmResponse {
    let prompt_tokens = request.user_prompt.split_whitespace().count() as u32;
    LlmResponse::success(format!("response to: {}", request.user_prompt))
        .with_usage(TokenUsage {
            prompt_tokens,
            completion_tokens: prompt_tokens + 3,
            total_tokens: prompt_tokens * 2 + 3,
        })
        .with_metadata(request.metadata.clone())
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Echoing completion client.
///
/// Responds with `"response to: <user prompt>"` and echoes request metadata.
/// Tracks call count and peak concurrency.
#[derive(Debug, Default)]
pub struct MockLlmClient {
    delay: Duration,
    transient_failures: u32,
    fail_marker: Option<String>,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call (cancellable).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The first `n` calls fail with a retryable 503.
    pub fn with_transient_failures(mut self, n: u32) -> Self {
        self.transient_failures = n;
        self
    }

    /// Requests whose user prompt contains `marker` fail with a non-retryable 400.
    pub fn failing_on(mut self, marker: impl Into<String>) -> Self {
        self.fail_marker = Some(marker.into());
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        request: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight::enter(&self.in_flight, &self.max_in_flight);

        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        } else {
            tokio::task::yield_now().await;
        }

        if call <= self.transient_failures {
            return Err(LlmError::from_status(503, "service unavailable"));
        }
        if let Some(marker) = &self.fail_marker {
            if request.user_prompt.contains(marker.as_str()) {
                return Err(LlmError::from_status(400, format!("rejected prompt: {}", request.user_prompt)));
            }
        }

        Ok(echo(request))
    }
}

/// Scripted batch client.
///
/// Each status query returns the next state of the script; the last state
/// repeats once the script runs out.
#[derive(Debug)]
pub struct MockBatchClient {
    provider: String,
    states: Vec<BatchState>,
    status_errors: usize,
    result_limit: Option<usize>,
    submitted: Mutex<Vec<LlmRequest>>,
    submissions: AtomicUsize,
    status_calls: AtomicUsize,
}

impl MockBatchClient {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            states: vec![BatchState::Running, BatchState::Completed],
            status_errors: 0,
            result_limit: None,
            submitted: Mutex::new(Vec::new()),
            submissions: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_states(mut self, states: Vec<BatchState>) -> Self {
        self.states = states;
        self
    }

    /// The first `n` status queries fail with a transport error.
    pub fn with_status_errors(mut self, n: usize) -> Self {
        self.status_errors = n;
        self
    }

    /// Return at most `n` results regardless of how many requests were submitted.
    pub fn with_result_limit(mut self, n: usize) -> Self {
        self.result_limit = Some(n);
        self
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn submitted_requests(&self) -> Vec<LlmRequest> {
        self.submitted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl BatchClient for MockBatchClient {
    async fn submit_batch(
        &self,
        requests: &[LlmRequest],
        cancel: &CancellationToken,
    ) -> Result<BatchJobId, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        *self.submitted.lock().unwrap_or_else(|e| e.into_inner()) = requests.to_vec();

        Ok(BatchJobId::new(format!("batch-{n}"), self.provider.clone()))
    }

    async fn batch_status(
        &self,
        id: &BatchJobId,
        cancel: &CancellationToken,
    ) -> Result<BatchStatus, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        let call = self.status_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.status_errors {
            return Err(LlmError::Transport("status endpoint unreachable".to_string()));
        }

        let step = call - self.status_errors;
        let state = self
            .states
            .get(step)
            .or(self.states.last())
            .copied()
            .unwrap_or(BatchState::Completed);
        let progress = if state.is_terminal() {
            1.0
        } else {
            (step + 1) as f32 / (self.states.len() + 1) as f32
        };

        Ok(BatchStatus::new(id.id.clone(), state, progress))
    }

    async fn batch_results(
        &self,
        _id: &BatchJobId,
        cancel: &CancellationToken,
    ) -> Result<Vec<LlmResponse>, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        let submitted = self.submitted_requests();
        let limit = self.result_limit.unwrap_or(submitted.len());
        Ok(submitted.iter().take(limit).map(echo).collect())
    }
}
