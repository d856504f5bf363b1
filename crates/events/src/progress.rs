//! Progress event contract.
//!
//! Events are process-level: one stream per `correlation_id` (the process id).
//! Individual job failures are not broadcast; they only live in persisted results.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Coarse status carried by every progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressStatus {
    InProgress,
    Completed,
    Failed,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressStatus::InProgress)
    }
}

/// A single progress update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Groups events of one unit of work (the process id).
    pub correlation_id: String,
    /// Total work items; `0` when unknown.
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub status: ProgressStatus,
    /// Human-readable message for display.
    pub message: String,
}

impl ProgressEvent {
    pub fn new(correlation_id: impl Into<String>, status: ProgressStatus) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            total: 0,
            completed: 0,
            failed: 0,
            status,
            message: String::new(),
        }
    }

    pub fn in_progress(correlation_id: impl Into<String>, completed: usize, total: usize) -> Self {
        Self::new(correlation_id, ProgressStatus::InProgress).with_counts(completed, total)
    }

    pub fn completed(correlation_id: impl Into<String>, completed: usize, total: usize) -> Self {
        Self::new(correlation_id, ProgressStatus::Completed).with_counts(completed, total)
    }

    pub fn failed(correlation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(correlation_id, ProgressStatus::Failed).with_message(message)
    }

    pub fn with_counts(mut self, completed: usize, total: usize) -> Self {
        self.completed = completed;
        self.total = total;
        self
    }

    pub fn with_failed(mut self, failed: usize) -> Self {
        self.failed = failed;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Destination for progress events.
///
/// Implementations must not block: `on_progress` is called from the job
/// processing path.
pub trait ProgressNotifier: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

impl<N> ProgressNotifier for Arc<N>
where
    N: ProgressNotifier + ?Sized,
{
    fn on_progress(&self, event: ProgressEvent) {
        (**self).on_progress(event)
    }
}

/// Notifier that discards every event (tests, headless runs).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl NoopNotifier {
    pub fn new() -> Self {
        Self
    }
}

impl ProgressNotifier for NoopNotifier {
    fn on_progress(&self, _event: ProgressEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_accepts_any_event() {
        let notifier = NoopNotifier::new();
        notifier.on_progress(ProgressEvent::in_progress("p", 5, 10).with_message("Processing..."));
        notifier.on_progress(ProgressEvent::new("p", ProgressStatus::Completed));
    }

    #[test]
    fn status_serializes_screaming_case() {
        let json = serde_json::to_string(&ProgressStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }

    #[test]
    fn only_in_progress_is_non_terminal() {
        assert!(!ProgressStatus::InProgress.is_terminal());
        assert!(ProgressStatus::Completed.is_terminal());
        assert!(ProgressStatus::Failed.is_terminal());
    }
}
