//! Execution strategy and provider-side batch descriptors.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// How a group of jobs is sent to the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkStrategy {
    /// Direct calls through a bounded worker pool.
    #[default]
    Sync,
    /// One provider-side asynchronous job, polled until terminal.
    Batch,
}

impl BulkStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkStrategy::Sync => "sync",
            BulkStrategy::Batch => "batch",
        }
    }
}

impl core::fmt::Display for BulkStrategy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BulkStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" | "" => Ok(BulkStrategy::Sync),
            "batch" => Ok(BulkStrategy::Batch),
            other => Err(CoreError::unknown_variant("bulk strategy", other)),
        }
    }
}

/// Handle into a provider-side batch job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchJobId {
    pub id: String,
    pub provider: String,
}

impl BatchJobId {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
        }
    }
}

impl core::fmt::Display for BatchJobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.provider, self.id)
    }
}

/// Lifecycle state of a provider-side batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl BatchState {
    /// Whether polling can stop and results can be fetched.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Completed | BatchState::Failed | BatchState::Cancelled | BatchState::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Queued => "QUEUED",
            BatchState::Running => "RUNNING",
            BatchState::Completed => "COMPLETED",
            BatchState::Failed => "FAILED",
            BatchState::Cancelled => "CANCELLED",
            BatchState::Expired => "EXPIRED",
        }
    }
}

impl core::fmt::Display for BatchState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by a batch status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub id: String,
    pub state: BatchState,
    /// Provider-reported completion fraction in `[0, 1]`.
    pub progress: f32,
}

impl BatchStatus {
    pub fn new(id: impl Into<String>, state: BatchState, progress: f32) -> Self {
        Self {
            id: id.into(),
            state,
            progress,
        }
    }

    /// Progress expressed as a whole percentage, clamped to `0..=100`.
    pub fn percent(&self) -> usize {
        (self.progress.clamp(0.0, 1.0) * 100.0).round() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("Batch".parse::<BulkStrategy>().unwrap(), BulkStrategy::Batch);
        assert_eq!(" sync ".parse::<BulkStrategy>().unwrap(), BulkStrategy::Sync);
        assert_eq!("".parse::<BulkStrategy>().unwrap(), BulkStrategy::Sync);
        assert!("stream".parse::<BulkStrategy>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!BatchState::Queued.is_terminal());
        assert!(!BatchState::Running.is_terminal());
        assert!(BatchState::Completed.is_terminal());
        assert!(BatchState::Failed.is_terminal());
        assert!(BatchState::Cancelled.is_terminal());
        assert!(BatchState::Expired.is_terminal());
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(BatchStatus::new("b", BatchState::Running, 0.5).percent(), 50);
        assert_eq!(BatchStatus::new("b", BatchState::Running, 1.7).percent(), 100);
        assert_eq!(BatchStatus::new("b", BatchState::Running, -0.2).percent(), 0);
    }
}
