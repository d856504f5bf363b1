//! Drives the pending jobs of one process to a terminal status.
//!
//! Two strategies:
//! - **Sync**: every job goes through the bulk executor, bounded by the
//!   configured concurrency
//! - **Batch**: the whole set is submitted as one provider-side job and
//!   polled until the provider reports a terminal state
//!
//! Individual job failures are recorded on the job. Only infrastructure
//! errors and cancellation surface as [`WorkerError`].

mod progress_client;

pub use progress_client::ProgressReportingClient;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use batchloom_core::{BatchJobId, BatchState, BulkStrategy, LlmRequest, LlmResponse, ProcessId};
use batchloom_events::{ProgressEvent, ProgressNotifier};
use batchloom_llm::{LlmError, ProviderRegistry, execute_bulk_sync};

use crate::jobs::{Job, JobQueue, JobQueueError, JobStatus, JobUpdate};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Provider id looked up in the [`ProviderRegistry`].
    pub provider: String,
    /// Desired strategy; may be downgraded to sync by the registry.
    pub strategy: BulkStrategy,
    /// Sync concurrency; the provider default applies when unset.
    pub concurrency: Option<usize>,
    /// Batch status polling period.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            strategy: BulkStrategy::Sync,
            concurrency: None,
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_strategy(mut self, strategy: BulkStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Summary of one `process` run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessReport {
    pub process_id: ProcessId,
    /// Strategy that actually ran.
    pub strategy: BulkStrategy,
    /// Jobs handled by this run (the pending set).
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub batch_job_id: Option<BatchJobId>,
}

impl ProcessReport {
    fn new(process_id: ProcessId, strategy: BulkStrategy, total: usize) -> Self {
        Self {
            process_id,
            strategy,
            total,
            succeeded: 0,
            failed: 0,
            batch_job_id: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("job queue error: {0}")]
    Queue(#[from] JobQueueError),
    #[error("provider error: {0}")]
    Provider(LlmError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("processing cancelled")]
    Cancelled,
}

impl From<LlmError> for WorkerError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Cancelled => WorkerError::Cancelled,
            other => WorkerError::Provider(other),
        }
    }
}

/// Executes the jobs of a process against the configured provider.
#[derive(Clone)]
pub struct Worker {
    queue: JobQueue,
    providers: Arc<ProviderRegistry>,
    notifier: Arc<dyn ProgressNotifier>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        queue: JobQueue,
        providers: Arc<ProviderRegistry>,
        notifier: Arc<dyn ProgressNotifier>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            providers,
            notifier,
            config,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// The strategy `process` will use with the current provider.
    pub fn effective_strategy(&self) -> BulkStrategy {
        self.providers
            .resolve_bulk_strategy(self.config.strategy, &self.config.provider)
    }

    /// Reset jobs interrupted by a crash so they run again (at-least-once).
    #[instrument(skip(self), err)]
    pub async fn recover(&self) -> Result<u64, JobQueueError> {
        let reset = self.queue.reset_in_progress().await?;
        if reset > 0 {
            info!(reset, "interrupted jobs returned to pending");
        }
        Ok(reset)
    }

    /// Run every Pending job of `process_id` to a terminal status.
    #[instrument(skip(self, cancel), fields(process_id = %process_id, provider = %self.config.provider), err)]
    pub async fn process(
        &self,
        process_id: ProcessId,
        cancel: &CancellationToken,
    ) -> Result<ProcessReport, WorkerError> {
        let jobs = self.queue.jobs_by_status(process_id, JobStatus::Pending).await?;
        let strategy = self.effective_strategy();

        if jobs.is_empty() {
            debug!("no pending jobs");
            return Ok(ProcessReport::new(process_id, strategy, 0));
        }
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }

        info!(jobs = jobs.len(), %strategy, "processing jobs");
        let report = match strategy {
            BulkStrategy::Sync => self.run_sync(process_id, &jobs, cancel).await?,
            BulkStrategy::Batch => self.run_batch(process_id, &jobs, cancel).await?,
        };

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "jobs finished"
        );
        Ok(report)
    }

    async fn run_sync(
        &self,
        process_id: ProcessId,
        jobs: &[Job],
        cancel: &CancellationToken,
    ) -> Result<ProcessReport, WorkerError> {
        let requests = decode_requests(jobs)?;
        let client = self.providers.client(&self.config.provider)?;
        let total = jobs.len();

        for job in jobs {
            self.queue.update_job(JobUpdate::in_progress(job.id)).await?;
        }

        let correlation_id = process_id.to_string();
        self.notifier.on_progress(
            ProgressEvent::in_progress(correlation_id.clone(), 0, total).with_message("Processing..."),
        );

        let reporting = Arc::new(ProgressReportingClient::new(
            client,
            Arc::clone(&self.notifier),
            correlation_id.clone(),
            total,
        ));
        let concurrency = self
            .config
            .concurrency
            .unwrap_or_else(|| self.providers.default_concurrency(&self.config.provider));

        let responses = execute_bulk_sync(reporting, requests, concurrency, cancel).await?;

        let mut report = ProcessReport::new(process_id, BulkStrategy::Sync, total);
        self.record_results(jobs, responses, &mut report).await?;

        self.notifier.on_progress(
            ProgressEvent::completed(correlation_id, report.succeeded, total)
                .with_failed(report.failed)
                .with_message("Sync processing finished"),
        );
        Ok(report)
    }

    async fn run_batch(
        &self,
        process_id: ProcessId,
        jobs: &[Job],
        cancel: &CancellationToken,
    ) -> Result<ProcessReport, WorkerError> {
        let requests = decode_requests(jobs)?;
        let batch = self.providers.batch_client(&self.config.provider)?;
        let total = jobs.len();
        let correlation_id = process_id.to_string();

        let handle = batch.submit_batch(&requests, cancel).await?;
        for job in jobs {
            self.queue
                .update_job(JobUpdate::in_batch(job.id, handle.clone()))
                .await?;
        }
        info!(batch = %handle, "batch submitted");
        self.notifier.on_progress(
            ProgressEvent::in_progress(correlation_id.clone(), 0, total)
                .with_message(format!("Batch {} submitted", handle.id)),
        );

        let period = self.config.poll_interval.max(MIN_POLL_INTERVAL);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
                _ = ticker.tick() => {}
            }

            let status = match batch.batch_status(&handle, cancel).await {
                Ok(status) => status,
                Err(LlmError::Cancelled) => return Err(WorkerError::Cancelled),
                Err(err) => {
                    warn!(batch = %handle, error = %err, "batch status query failed; will poll again");
                    continue;
                }
            };

            if !status.state.is_terminal() {
                let percent = status.percent();
                debug!(batch = %handle, state = %status.state, percent, "batch still running");
                self.notifier.on_progress(
                    ProgressEvent::in_progress(correlation_id.clone(), total * percent / 100, total)
                        .with_message(format!("Batch {}: {percent}%", status.state)),
                );
                continue;
            }

            info!(batch = %handle, state = %status.state, "batch reached terminal state");
            let mut results = batch.batch_results(&handle, cancel).await?;
            results.truncate(total);

            let mut report = ProcessReport::new(process_id, BulkStrategy::Batch, total);
            report.batch_job_id = Some(handle.clone());
            self.record_results(jobs, results, &mut report).await?;

            let event = if status.state == BatchState::Completed {
                ProgressEvent::completed(correlation_id, report.succeeded, total)
                    .with_failed(report.failed)
                    .with_message("Batch processing finished")
            } else {
                ProgressEvent::failed(correlation_id, format!("Batch ended in state {}", status.state))
                    .with_counts(report.succeeded, total)
                    .with_failed(report.failed)
            };
            self.notifier.on_progress(event);

            return Ok(report);
        }
    }

    /// Write positional results back; jobs without a result are marked Failed.
    async fn record_results(
        &self,
        jobs: &[Job],
        responses: Vec<LlmResponse>,
        report: &mut ProcessReport,
    ) -> Result<(), WorkerError> {
        let mut responses = responses.into_iter();

        for job in jobs {
            let update = match responses.next() {
                Some(response) if response.success => {
                    report.succeeded += 1;
                    JobUpdate::completed(job.id, response)
                }
                Some(response) => {
                    report.failed += 1;
                    let error = match response.error_message() {
                        "" => "provider reported failure without a message",
                        message => message,
                    };
                    JobUpdate::failed(job.id, error)
                }
                None => {
                    report.failed += 1;
                    JobUpdate::failed(job.id, "no result returned for job")
                }
            };
            self.queue.update_job(update).await?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("providers", &self.providers)
            .finish()
    }
}

fn decode_requests(jobs: &[Job]) -> Result<Vec<LlmRequest>, WorkerError> {
    jobs.iter()
        .map(|job| {
            job.request()
                .map_err(|e| WorkerError::Serialization(e.to_string()))
        })
        .collect()
}
