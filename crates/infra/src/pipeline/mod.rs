//! Slice orchestration on top of the job queue and worker.

pub mod manager;
pub mod slice;
pub mod store;

pub use manager::{PipelineConfig, PipelineError, PipelineManager};
pub use slice::{Slice, SliceRegistry};
pub use store::{ProcessPhase, ProcessState, ProcessStore, ProcessStoreError};
