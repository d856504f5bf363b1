//! Provider lookup and execution-strategy resolution.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use batchloom_core::BulkStrategy;

use crate::client::{BatchClient, LlmClient};
use crate::error::LlmError;
use crate::retry::{RetryPolicy, RetryingClient};

/// Sync concurrency used when neither the worker nor the provider entry sets one.
///
/// Local inference servers handle one request at a time; hosted APIs take a few.
pub fn default_concurrency_for(provider: &str) -> usize {
    match provider {
        "local" => 1,
        _ => 5,
    }
}

/// Everything registered for one provider id.
#[derive(Clone)]
pub struct ProviderEntry {
    client: Arc<dyn LlmClient>,
    batch: Option<Arc<dyn BatchClient>>,
    default_concurrency: Option<usize>,
    retrying: bool,
}

impl ProviderEntry {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            batch: None,
            default_concurrency: None,
            retrying: false,
        }
    }

    pub fn with_batch(mut self, batch: Arc<dyn BatchClient>) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn with_default_concurrency(mut self, concurrency: usize) -> Self {
        self.default_concurrency = Some(concurrency.max(1));
        self
    }

    /// Wrap the sync client so every call goes through `policy`.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.client = Arc::new(RetryingClient::new(self.client, policy));
        self.retrying = true;
        self
    }
}

/// Provider id → clients.
///
/// Built once at startup and shared read-only.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderEntry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, id: impl Into<String>, entry: ProviderEntry) -> Self {
        self.register(id, entry);
        self
    }

    pub fn register(&mut self, id: impl Into<String>, entry: ProviderEntry) {
        self.providers.insert(id.into(), entry);
    }

    /// Apply `policy` to every entry that has no retry policy of its own.
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        for entry in self.providers.values_mut() {
            if !entry.retrying {
                *entry = entry.clone().with_retry(policy.clone());
            }
        }
        self
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }

    pub fn client(&self, provider: &str) -> Result<Arc<dyn LlmClient>, LlmError> {
        self.entry(provider).map(|e| Arc::clone(&e.client))
    }

    pub fn batch_client(&self, provider: &str) -> Result<Arc<dyn BatchClient>, LlmError> {
        self.entry(provider)?
            .batch
            .clone()
            .ok_or_else(|| LlmError::BatchUnsupported(provider.to_string()))
    }

    pub fn supports_batch(&self, provider: &str) -> bool {
        self.providers
            .get(provider)
            .is_some_and(|e| e.batch.is_some())
    }

    /// The strategy that will actually run: `Batch` degrades to `Sync` when
    /// the provider has no batch client.
    pub fn resolve_bulk_strategy(&self, desired: BulkStrategy, provider: &str) -> BulkStrategy {
        match desired {
            BulkStrategy::Batch if !self.supports_batch(provider) => {
                warn!(provider, "batch strategy not supported by provider; falling back to sync");
                BulkStrategy::Sync
            }
            other => other,
        }
    }

    pub fn default_concurrency(&self, provider: &str) -> usize {
        self.providers
            .get(provider)
            .and_then(|e| e.default_concurrency)
            .unwrap_or_else(|| default_concurrency_for(provider))
    }

    fn entry(&self, provider: &str) -> Result<&ProviderEntry, LlmError> {
        self.providers
            .get(provider)
            .ok_or_else(|| LlmError::UnknownProvider(provider.to_string()))
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        f.debug_struct("ProviderRegistry").field("providers", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBatchClient, MockLlmClient};

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new()
            .with_provider("local", ProviderEntry::new(Arc::new(MockLlmClient::new())))
            .with_provider(
                "hosted",
                ProviderEntry::new(Arc::new(MockLlmClient::new()))
                    .with_batch(Arc::new(MockBatchClient::new("hosted"))),
            )
    }

    #[test]
    fn batch_falls_back_to_sync_without_batch_client() {
        let registry = registry();
        assert_eq!(registry.resolve_bulk_strategy(BulkStrategy::Batch, "local"), BulkStrategy::Sync);
        assert_eq!(registry.resolve_bulk_strategy(BulkStrategy::Batch, "missing"), BulkStrategy::Sync);
        assert_eq!(registry.resolve_bulk_strategy(BulkStrategy::Batch, "hosted"), BulkStrategy::Batch);
        assert_eq!(registry.resolve_bulk_strategy(BulkStrategy::Sync, "hosted"), BulkStrategy::Sync);
    }

    #[test]
    fn lookup_errors() {
        let registry = registry();
        assert!(matches!(registry.client("missing"), Err(LlmError::UnknownProvider(_))));
        assert!(matches!(registry.batch_client("local"), Err(LlmError::BatchUnsupported(_))));
        assert!(registry.batch_client("hosted").is_ok());
    }

    #[tokio::test]
    async fn default_retry_wraps_plain_entries() {
        let flaky = Arc::new(MockLlmClient::new().with_transient_failures(1));
        let fast = RetryPolicy::exponential(
            2,
            std::time::Duration::from_millis(1),
            std::time::Duration::from_millis(1),
        );
        let registry = ProviderRegistry::new()
            .with_provider("flaky", ProviderEntry::new(flaky.clone()))
            .with_default_retry(fast);

        let client = registry.client("flaky").unwrap();
        let response = client
            .complete(
                &batchloom_core::LlmRequest::new("", "hi"),
                &tokio_util::sync::CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(flaky.calls(), 2);
    }

    #[test]
    fn default_concurrency_by_provider() {
        let registry = registry().with_provider(
            "tuned",
            ProviderEntry::new(Arc::new(MockLlmClient::new())).with_default_concurrency(12),
        );
        assert_eq!(registry.default_concurrency("local"), 1);
        assert_eq!(registry.default_concurrency("hosted"), 5);
        assert_eq!(registry.default_concurrency("tuned"), 12);
    }
}
