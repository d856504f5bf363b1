//! Persisted job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use batchloom_core::{BatchJobId, JobId, LlmRequest, LlmResponse, ProcessId};

/// Job lifecycle: `Pending → InProgress → {Completed | Failed}`.
///
/// Recovery is the only path back: `InProgress → Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "IN_PROGRESS" => Some(JobStatus::InProgress),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<sqlx::Sqlite> for JobStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for JobStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<'r, sqlx::Sqlite>>::decode(value)?;
        JobStatus::parse(s).ok_or_else(|| format!("invalid JobStatus: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for JobStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        let s = self.as_str();
        <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode_by_ref(&s, buf)
    }
}

/// One LLM request and, once terminal, its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub process_id: ProcessId,
    /// Zero-based index within the submission.
    pub position: u32,
    /// Serialized [`LlmRequest`].
    pub request_json: String,
    pub status: JobStatus,
    pub batch_job_id: Option<BatchJobId>,
    /// Serialized [`LlmResponse`], set on `Completed`.
    pub response_json: Option<String>,
    /// Set on `Failed`.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn request(&self) -> Result<LlmRequest, JobQueueError> {
        serde_json::from_str(&self.request_json).map_err(|e| {
            JobQueueError::Serialization(format!("job {}: invalid request payload: {e}", self.id))
        })
    }

    /// Decoded response, `None` when the job has none recorded.
    pub fn response(&self) -> Result<Option<LlmResponse>, JobQueueError> {
        self.response_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| {
                JobQueueError::Serialization(format!("job {}: invalid response payload: {e}", self.id))
            })
    }
}

/// A single-row status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub id: JobId,
    pub status: JobStatus,
    /// Kept as-is when `None`.
    pub batch_job_id: Option<BatchJobId>,
    pub response: Option<LlmResponse>,
    pub error_message: Option<String>,
}

impl JobUpdate {
    fn new(id: JobId, status: JobStatus) -> Self {
        Self {
            id,
            status,
            batch_job_id: None,
            response: None,
            error_message: None,
        }
    }

    pub fn in_progress(id: JobId) -> Self {
        Self::new(id, JobStatus::InProgress)
    }

    pub fn in_batch(id: JobId, batch: BatchJobId) -> Self {
        Self {
            batch_job_id: Some(batch),
            ..Self::new(id, JobStatus::InProgress)
        }
    }

    pub fn completed(id: JobId, response: LlmResponse) -> Self {
        Self {
            response: Some(response),
            ..Self::new(id, JobStatus::Completed)
        }
    }

    pub fn failed(id: JobId, error: impl Into<String>) -> Self {
        Self {
            error_message: Some(error.into()),
            ..Self::new(id, JobStatus::Failed)
        }
    }
}

/// Per-status job counts for one process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed
    }

    pub(crate) fn add(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::InProgress => self.in_progress += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}

/// Job queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobQueueError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid job row: {0}")]
    InvalidRow(String),
}
