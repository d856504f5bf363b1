//! Shared fixtures for unit and integration tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use batchloom_core::{LlmRequest, LlmResponse};

use crate::db;
use crate::pipeline::Slice;

pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = db::in_memory().await.expect("in-memory database");
    db::migrate(&pool).await.expect("migrations");
    pool
}

/// Slice that turns `{"prompts": [..]}` into one request per prompt and
/// records every `save_results` call.
pub(crate) struct RecordingSlice {
    id: String,
    fail_save: AtomicBool,
    panic_on_save: AtomicBool,
    prepared: AtomicUsize,
    saved: Mutex<Vec<Vec<LlmResponse>>>,
}

impl RecordingSlice {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            fail_save: AtomicBool::new(false),
            panic_on_save: AtomicBool::new(false),
            prepared: AtomicUsize::new(0),
            saved: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing_save(self) -> Self {
        self.fail_save.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn panicking_save(self) -> Self {
        self.panic_on_save.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn saves(&self) -> Vec<Vec<LlmResponse>> {
        self.saved.lock().unwrap().clone()
    }

    pub(crate) fn prepared(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }
}

pub(crate) fn prompts_input(prompts: &[&str]) -> serde_json::Value {
    serde_json::json!({ "prompts": prompts })
}

#[async_trait]
impl Slice for RecordingSlice {
    fn id(&self) -> &str {
        &self.id
    }

    async fn prepare_prompts(
        &self,
        input: serde_json::Value,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<LlmRequest>> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        let prompts = input
            .get("prompts")
            .and_then(|p| p.as_array())
            .ok_or_else(|| anyhow::anyhow!("input has no prompts array"))?;

        Ok(prompts
            .iter()
            .enumerate()
            .map(|(i, p)| {
                LlmRequest::new("You write NPC dialogue.", p.as_str().unwrap_or_default())
                    .with_metadata("record_id", format!("REC_{i:03}"))
            })
            .collect())
    }

    async fn save_results(
        &self,
        responses: Vec<LlmResponse>,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        if self.panic_on_save.load(Ordering::SeqCst) {
            panic!("slice exploded while saving");
        }
        if self.fail_save.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.saved.lock().unwrap().push(responses);
        Ok(())
    }
}
