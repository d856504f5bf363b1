use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use batchloom_core::{LlmRequest, LlmResponse};
use batchloom_events::{ProgressEvent, ProgressNotifier};
use batchloom_llm::{LlmClient, LlmError};

/// Client decorator that emits one progress event per finished call.
///
/// Counters are shared by every task of the bulk executor, so events carry
/// the running total for the whole process.
pub struct ProgressReportingClient {
    inner: Arc<dyn LlmClient>,
    notifier: Arc<dyn ProgressNotifier>,
    correlation_id: String,
    total: usize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl ProgressReportingClient {
    pub fn new(
        inner: Arc<dyn LlmClient>,
        notifier: Arc<dyn ProgressNotifier>,
        correlation_id: impl Into<String>,
        total: usize,
    ) -> Self {
        Self {
            inner,
            notifier,
            correlation_id: correlation_id.into(),
            total,
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    pub fn finished(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ProgressReportingClient {
    async fn complete(
        &self,
        request: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        let result = self.inner.complete(request, cancel).await;
        if matches!(result, Err(LlmError::Cancelled)) {
            return result;
        }

        let failed = match &result {
            Ok(response) if response.success => self.failed.load(Ordering::SeqCst),
            _ => self.failed.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;

        self.notifier.on_progress(
            ProgressEvent::in_progress(self.correlation_id.clone(), done, self.total)
                .with_failed(failed)
                .with_message(format!("Processed {done}/{}", self.total)),
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchloom_events::{ProgressHub, ProgressStatus};
    use batchloom_llm::mock::MockLlmClient;

    #[tokio::test]
    async fn emits_running_totals() {
        let hub = Arc::new(ProgressHub::new());
        let mut sub = hub.subscribe();
        let inner = Arc::new(MockLlmClient::new().failing_on("bad"));
        let client = ProgressReportingClient::new(inner, hub.clone(), "proc-1", 2);
        let cancel = CancellationToken::new();

        client.complete(&LlmRequest::new("", "good"), &cancel).await.unwrap();
        let _ = client.complete(&LlmRequest::new("", "bad"), &cancel).await;

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!((first.completed, first.failed, first.total), (1, 0, 2));
        assert_eq!((second.completed, second.failed), (2, 1));
        assert_eq!(second.status, ProgressStatus::InProgress);
        assert_eq!(client.finished(), 2);
    }
}
