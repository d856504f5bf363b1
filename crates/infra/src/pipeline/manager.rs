//! Process lifecycle: dispatch, completion, recovery.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use batchloom_core::{LlmResponse, ProcessId};
use batchloom_events::{ProgressEvent, ProgressNotifier};

use super::slice::SliceRegistry;
use super::store::{ProcessPhase, ProcessState, ProcessStore, ProcessStoreError};
use crate::jobs::{Job, JobQueue, JobQueueError, JobStatus};
use crate::worker::{ProcessReport, Worker, WorkerError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Tasks draining the dispatch queue; each drives one process at a time.
    pub supervisors: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            supervisors: 4,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("slice not registered: {0}")]
    SliceNotRegistered(String),
    #[error("slice '{slice}' failed to prepare prompts: {message}")]
    Prepare { slice: String, message: String },
    #[error(transparent)]
    Queue(#[from] JobQueueError),
    #[error(transparent)]
    Store(#[from] ProcessStoreError),
    #[error("pipeline is shutting down")]
    ShuttingDown,
}

struct Inner {
    slices: SliceRegistry,
    queue: JobQueue,
    store: ProcessStore,
    worker: Worker,
    notifier: Arc<dyn ProgressNotifier>,
    root: CancellationToken,
}

/// Orchestrates slices, the job queue and the worker.
///
/// Per process: `Dispatched → (worker) → PendingCallback → {Completed | Failed}`.
/// Completed processes leave nothing behind; failed ones keep their state row
/// and jobs for inspection.
pub struct PipelineManager {
    inner: Arc<Inner>,
    intake: Mutex<Option<mpsc::UnboundedSender<ProcessId>>>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

impl PipelineManager {
    /// Spawn the supervisor pool. Must be called inside a Tokio runtime.
    pub fn start(
        config: PipelineConfig,
        slices: SliceRegistry,
        worker: Worker,
        store: ProcessStore,
        notifier: Arc<dyn ProgressNotifier>,
    ) -> Self {
        // Unbounded so queueing never waits on a busy supervisor; the pool size
        // alone bounds how many processes run at once.
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(AsyncMutex::new(rx));

        let inner = Arc::new(Inner {
            slices,
            queue: worker.queue().clone(),
            store,
            worker,
            notifier,
            root: CancellationToken::new(),
        });

        let count = config.supervisors.max(1);
        let supervisors = (0..count)
            .map(|n| tokio::spawn(supervise(n, Arc::clone(&inner), Arc::clone(&rx))))
            .collect();

        info!(supervisors = count, slices = ?inner.slices.ids(), "pipeline started");

        Self {
            inner,
            intake: Mutex::new(Some(tx)),
            supervisors: Mutex::new(supervisors),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    pub fn store(&self) -> &ProcessStore {
        &self.inner.store
    }

    /// Root token; cancelling it aborts every in-flight process.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.root
    }

    pub fn is_shutting_down(&self) -> bool {
        self.intake.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Prepare, persist and enqueue one unit of work for `slice_id`.
    ///
    /// Returns as soon as the process is queued; completion is reported
    /// through progress events.
    #[instrument(skip(self, input), fields(slice = %slice_id), err)]
    pub async fn execute_slice(
        &self,
        slice_id: &str,
        input: serde_json::Value,
        input_reference: &str,
    ) -> Result<ProcessId, PipelineError> {
        let intake = self.sender()?;
        let slice = self
            .inner
            .slices
            .get(slice_id)
            .ok_or_else(|| PipelineError::SliceNotRegistered(slice_id.to_string()))?;

        let requests = slice
            .prepare_prompts(input, &self.inner.root)
            .await
            .map_err(|e| PipelineError::Prepare {
                slice: slice_id.to_string(),
                message: format!("{e:#}"),
            })?;

        let process_id = ProcessId::new();
        self.inner
            .store
            .create(&ProcessState::dispatched(process_id, slice_id, input_reference))
            .await?;

        if let Err(err) = self.inner.queue.submit_jobs(process_id, &requests).await {
            if let Err(cleanup) = self.inner.store.delete(process_id).await {
                warn!(%process_id, error = %cleanup, "failed to remove state after submission error");
            }
            return Err(err.into());
        }

        info!(%process_id, jobs = requests.len(), "process dispatched");

        // A closed queue leaves the state Dispatched; the next `recover` resumes it.
        intake
            .send(process_id)
            .map_err(|_| PipelineError::ShuttingDown)?;

        Ok(process_id)
    }

    /// Finish a process after the worker ran. Returns the phase it ended in.
    pub async fn handle_completion(
        &self,
        process_id: ProcessId,
        worker_result: Result<ProcessReport, WorkerError>,
    ) -> Result<ProcessPhase, PipelineError> {
        let cancel = self.inner.root.child_token();
        self.inner
            .handle_completion(process_id, worker_result, &cancel)
            .await
    }

    /// Resume every process interrupted before it finished.
    ///
    /// Interrupted jobs go back to Pending first, so each resumed process
    /// re-executes whatever had not completed. Returns the number resumed.
    #[instrument(skip(self), err)]
    pub async fn recover(&self) -> Result<usize, PipelineError> {
        let intake = self.sender()?;

        self.inner.worker.recover().await?;
        let states = self.inner.store.list_active().await?;

        for state in &states {
            debug!(process_id = %state.process_id, phase = %state.phase, "resuming process");
            intake
                .send(state.process_id)
                .map_err(|_| PipelineError::ShuttingDown)?;
        }

        info!(resumed = states.len(), "recovery complete");
        Ok(states.len())
    }

    /// Stop accepting work and wait for every queued and running process.
    pub async fn shutdown(&self) {
        // dropping the last sender lets supervisors drain the queue and exit
        drop(self.intake.lock().unwrap_or_else(|e| e.into_inner()).take());

        let handles = std::mem::take(&mut *self.supervisors.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "supervisor task ended abnormally");
            }
        }
        info!("pipeline stopped");
    }

    /// Cancel in-flight processes, then shut down.
    pub async fn shutdown_now(&self) {
        self.inner.root.cancel();
        self.shutdown().await;
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<ProcessId>, PipelineError> {
        self.intake
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(PipelineError::ShuttingDown)
    }
}

impl std::fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineManager")
            .field("slices", &self.inner.slices)
            .field("worker", &self.inner.worker)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

async fn supervise(
    n: usize,
    inner: Arc<Inner>,
    intake: Arc<AsyncMutex<mpsc::UnboundedReceiver<ProcessId>>>,
) {
    debug!(supervisor = n, "supervisor started");
    loop {
        let next = intake.lock().await.recv().await;
        let Some(process_id) = next else { break };
        inner.dispatch(process_id).await;
    }
    debug!(supervisor = n, "supervisor stopped");
}

impl Inner {
    /// Drive one process in its own task so a panic is contained and recorded.
    async fn dispatch(self: &Arc<Self>, process_id: ProcessId) {
        let cancel = self.root.child_token();
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.drive(process_id, cancel).await });

        match task.await {
            Ok(()) => {}
            Err(err) if err.is_panic() => {
                error!(%process_id, "process dispatch panicked");
                self.mark_failed(process_id, "process dispatch panicked").await;
            }
            Err(err) => warn!(%process_id, error = %err, "process dispatch aborted"),
        }
    }

    async fn drive(&self, process_id: ProcessId, cancel: CancellationToken) {
        let result = self.worker.process(process_id, &cancel).await;
        match self.handle_completion(process_id, result, &cancel).await {
            Ok(phase) => debug!(%process_id, %phase, "process settled"),
            Err(err) => error!(%process_id, error = %err, "completion handling failed"),
        }
    }

    #[instrument(skip(self, worker_result, cancel), fields(process_id = %process_id), err)]
    async fn handle_completion(
        &self,
        process_id: ProcessId,
        worker_result: Result<ProcessReport, WorkerError>,
        cancel: &CancellationToken,
    ) -> Result<ProcessPhase, PipelineError> {
        let report = match worker_result {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, "worker failed");
                self.mark_failed(process_id, &format!("worker failed: {err}")).await;
                return Ok(ProcessPhase::Failed);
            }
        };

        let state = self
            .store
            .get(process_id)
            .await?
            .ok_or(ProcessStoreError::NotFound(process_id))?;
        let Some(slice) = self.slices.get(&state.target_slice) else {
            self.mark_failed(process_id, &format!("slice '{}' is not registered", state.target_slice))
                .await;
            return Err(PipelineError::SliceNotRegistered(state.target_slice));
        };

        if let Some(batch) = &report.batch_job_id {
            self.store.set_batch_job_id(process_id, batch).await?;
        }
        self.store
            .update_phase(process_id, ProcessPhase::PendingCallback)
            .await?;

        let jobs = self.queue.results(process_id).await?;
        let responses: Vec<LlmResponse> = jobs.iter().map(response_for_job).collect();
        let total = responses.len();
        let succeeded = responses.iter().filter(|r| r.success).count();

        match slice.save_results(responses, cancel).await {
            Ok(()) => {
                let deleted = self.queue.delete_jobs(process_id).await?;
                self.store.delete(process_id).await?;

                info!(jobs = deleted, succeeded, failed = total - succeeded, "process completed");
                self.notifier.on_progress(
                    ProgressEvent::completed(process_id.to_string(), succeeded, total)
                        .with_failed(total - succeeded)
                        .with_message("Results saved"),
                );
                Ok(ProcessPhase::Completed)
            }
            Err(err) => {
                let message = format!("saving results failed: {err:#}");
                error!(error = %message, "slice rejected results");
                self.mark_failed(process_id, &message).await;
                Ok(ProcessPhase::Failed)
            }
        }
    }

    /// Record a process-level failure. Jobs are kept.
    async fn mark_failed(&self, process_id: ProcessId, message: &str) {
        if let Err(err) = self.store.update_phase(process_id, ProcessPhase::Failed).await {
            warn!(%process_id, error = %err, "could not persist failed phase");
        }
        self.notifier
            .on_progress(ProgressEvent::failed(process_id.to_string(), message));
    }
}

/// The response handed to the slice for one job.
///
/// Anything other than a stored successful response becomes a failure record
/// carrying the request metadata.
fn response_for_job(job: &Job) -> LlmResponse {
    let metadata = job.request().map(|r| r.metadata).unwrap_or_default();

    match job.status {
        JobStatus::Completed => match job.response() {
            Ok(Some(response)) => response,
            Ok(None) => LlmResponse::failure("completed job has no stored response").with_metadata(metadata),
            Err(err) => LlmResponse::failure(err.to_string()).with_metadata(metadata),
        },
        JobStatus::Failed => {
            let error = job.error_message.clone().unwrap_or_else(|| "job failed".to_string());
            LlmResponse::failure(error).with_metadata(metadata)
        }
        status => {
            LlmResponse::failure(format!("job did not finish (status {status})")).with_metadata(metadata)
        }
    }
}
