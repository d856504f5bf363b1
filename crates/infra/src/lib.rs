//! Infrastructure layer: SQLite storage, the worker and the slice pipeline.

pub mod config;
pub mod db;
pub mod engine;
pub mod jobs;
pub mod pipeline;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;


pub use config::EngineConfig;
pub use db::DatabaseConfig;
pub use jobs::{Job, JobQueue, JobQueueError, JobStats, JobStatus, JobUpdate};
pub use pipeline::{
    PipelineConfig, PipelineError, PipelineManager, ProcessPhase, ProcessState, ProcessStore,
    ProcessStoreError, Slice, SliceRegistry,
};
pub use worker::{ProcessReport, Worker, WorkerConfig, WorkerError};
