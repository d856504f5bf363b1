//! LLM provider contracts and the execution primitives built on them.
//!
//! - [`client`]: sync and batch provider traits
//! - [`retry`]: bounded exponential backoff and a retrying client decorator
//! - [`bulk`]: fan-out of independent requests through a bounded pool
//! - [`registry`]: provider lookup and strategy resolution
//! - [`mock`]: deterministic clients for tests and local runs

pub mod bulk;
pub mod client;
pub mod error;
pub mod mock;
pub mod registry;
pub mod retry;

pub use bulk::execute_bulk_sync;
pub use client::{BatchClient, LlmClient};
pub use error::{LlmError, is_retryable_status};
pub use registry::{ProviderEntry, ProviderRegistry, default_concurrency_for};
pub use retry::{RetryPolicy, RetryingClient, retry_with_backoff};
