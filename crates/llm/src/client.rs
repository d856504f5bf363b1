//! Provider client contracts.
//!
//! Every call receives the caller's cancellation token; implementations are
//! expected to abort in-flight I/O when it fires.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use batchloom_core::{BatchJobId, BatchStatus, LlmRequest, LlmResponse};

use crate::error::LlmError;

/// Synchronous (request/response) completion client.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        request: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, LlmError>;
}

/// Provider-side asynchronous batch API.
#[async_trait]
pub trait BatchClient: Send + Sync {
    /// Submit all requests as one provider job.
    async fn submit_batch(
        &self,
        requests: &[LlmRequest],
        cancel: &CancellationToken,
    ) -> Result<BatchJobId, LlmError>;

    async fn batch_status(
        &self,
        id: &BatchJobId,
        cancel: &CancellationToken,
    ) -> Result<BatchStatus, LlmError>;

    /// Results in submission order. Only meaningful once the batch is terminal.
    async fn batch_results(
        &self,
        id: &BatchJobId,
        cancel: &CancellationToken,
    ) -> Result<Vec<LlmResponse>, LlmError>;
}

#[async_trait]
impl<C> LlmClient for Arc<C>
where
    C: LlmClient + ?Sized,
{
    async fn complete(
        &self,
        request: &LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        (**self).complete(request, cancel).await
    }
}
