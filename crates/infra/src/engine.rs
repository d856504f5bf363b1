//! Startup wiring: database, providers, worker and pipeline.

use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::info;

use batchloom_events::ProgressNotifier;
use batchloom_llm::ProviderRegistry;

use crate::config::EngineConfig;
use crate::db;
use crate::jobs::JobQueue;
use crate::pipeline::{PipelineManager, ProcessStore, SliceRegistry};
use crate::worker::Worker;

/// Open the database, start the pipeline and resume interrupted processes.
///
/// Call `batchloom_observability::init()` beforehand so startup recovery is logged.
pub async fn start(
    config: EngineConfig,
    providers: ProviderRegistry,
    slices: SliceRegistry,
    notifier: Arc<dyn ProgressNotifier>,
) -> anyhow::Result<PipelineManager> {
    if !providers.contains(&config.worker.provider) {
        bail!("provider '{}' is not registered", config.worker.provider);
    }

    let pool = db::open(&config.database)
        .await
        .context("failed to prepare job database")?;
    let providers = providers.with_default_retry(config.retry.clone());

    let worker = Worker::new(
        JobQueue::new(pool.clone()),
        Arc::new(providers),
        Arc::clone(&notifier),
        config.worker.clone(),
    );
    info!(
        provider = %config.worker.provider,
        strategy = %worker.effective_strategy(),
        "engine starting"
    );

    let manager = PipelineManager::start(
        config.pipeline,
        slices,
        worker,
        ProcessStore::new(pool),
        notifier,
    );
    let resumed = manager
        .recover()
        .await
        .context("startup recovery failed")?;
    info!(resumed, "engine started");

    Ok(manager)
}
