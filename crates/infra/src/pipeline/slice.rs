//! Domain plug-ins that turn input into prompts and consume the results.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use batchloom_core::{LlmRequest, LlmResponse};

/// A unit of domain work run through the pipeline.
///
/// `save_results` receives exactly one response per request returned by
/// `prepare_prompts`, in the same order. Failed requests arrive as failure
/// responses carrying the request metadata, so slices can still correlate them.
#[async_trait]
pub trait Slice: Send + Sync {
    /// Stable identifier; persisted with every process of this slice.
    fn id(&self) -> &str;

    async fn prepare_prompts(
        &self,
        input: serde_json::Value,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<LlmRequest>>;

    async fn save_results(
        &self,
        responses: Vec<LlmResponse>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Slices by id. Built once at startup, then owned by the pipeline.
#[derive(Clone, Default)]
pub struct SliceRegistry {
    slices: HashMap<String, Arc<dyn Slice>>,
}

impl SliceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slice(mut self, slice: Arc<dyn Slice>) -> Self {
        self.register(slice);
        self
    }

    /// Register `slice` under its id, returning the slice it replaced.
    pub fn register(&mut self, slice: Arc<dyn Slice>) -> Option<Arc<dyn Slice>> {
        self.slices.insert(slice.id().to_string(), slice)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Slice>> {
        self.slices.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.slices.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

impl std::fmt::Debug for SliceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceRegistry").field("slices", &self.ids()).finish()
    }
}
