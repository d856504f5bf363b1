//! Progress notifications emitted by the orchestration engine.
//!
//! Progress is **observational**: it is never part of the correctness contract,
//! so delivery is best-effort and a slow consumer can never stall job processing.

pub mod hub;
pub mod progress;

pub use hub::{ProgressHub, SubscriberId, Subscription};
pub use progress::{NoopNotifier, ProgressEvent, ProgressNotifier, ProgressStatus};
