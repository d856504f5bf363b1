//! `batchloom-core`: shared building blocks for the orchestration engine.
//!
//! This crate contains **provider-agnostic** types only (no storage, no I/O):
//! identifiers, the LLM request/response contract and batch descriptors.

pub mod batch;
pub mod error;
pub mod id;
pub mod request;

pub use batch::{BatchJobId, BatchState, BatchStatus, BulkStrategy};
pub use error::CoreError;
pub use id::{JobId, ProcessId};
pub use request::{LlmRequest, LlmResponse, Metadata, TokenUsage};
