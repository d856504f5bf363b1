//! Process-wide tracing setup.
//!
//! The library crates only emit `tracing` events and never install a
//! subscriber. The binary embedding the engine calls [`init`] once in `main`,
//! before `batchloom_infra::engine::start`, so recovery at startup is logged.

/// Subscriber configuration (filters, output format).
pub mod subscriber;

pub use subscriber::{ENV_LOG_FORMAT, LogFormat};

/// Initialize tracing for the process.
///
/// Output format comes from `BATCHLOOM_LOG_FORMAT` (`json` or `pretty`),
/// filtering from `RUST_LOG`. Safe to call multiple times; later calls are no-ops.
pub fn init() {
    subscriber::init(LogFormat::from_env());
}
