//! Resumable orchestration records, one per dispatched process.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};
use tracing::{debug, instrument};

use batchloom_core::{BatchJobId, ProcessId};

/// Where a process is in the pipeline.
///
/// `Dispatched → PendingCallback → {Completed | Failed}`. Completed records
/// are deleted rather than stored, so in practice only the other three are
/// ever read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessPhase {
    Dispatched,
    PendingCallback,
    Completed,
    Failed,
}

impl ProcessPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessPhase::Dispatched => "DISPATCHED",
            ProcessPhase::PendingCallback => "PENDING_CALLBACK",
            ProcessPhase::Completed => "COMPLETED",
            ProcessPhase::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DISPATCHED" => Some(ProcessPhase::Dispatched),
            "PENDING_CALLBACK" => Some(ProcessPhase::PendingCallback),
            "COMPLETED" => Some(ProcessPhase::Completed),
            "FAILED" => Some(ProcessPhase::Failed),
            _ => None,
        }
    }

    /// Whether `recover` picks the process up again.
    pub fn is_resumable(&self) -> bool {
        matches!(self, ProcessPhase::Dispatched | ProcessPhase::PendingCallback)
    }
}

impl std::fmt::Display for ProcessPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<sqlx::Sqlite> for ProcessPhase {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for ProcessPhase {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<'r, sqlx::Sqlite>>::decode(value)?;
        ProcessPhase::parse(s).ok_or_else(|| format!("invalid ProcessPhase: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for ProcessPhase {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        let s = self.as_str();
        <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode_by_ref(&s, buf)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessState {
    pub process_id: ProcessId,
    /// Id of the slice that receives the results.
    pub target_slice: String,
    /// Opaque description of the domain input, e.g. a source file path.
    pub input_reference: String,
    pub batch_job_id: Option<BatchJobId>,
    pub phase: ProcessPhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessState {
    pub fn dispatched(
        process_id: ProcessId,
        target_slice: impl Into<String>,
        input_reference: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            process_id,
            target_slice: target_slice.into(),
            input_reference: input_reference.into(),
            batch_job_id: None,
            phase: ProcessPhase::Dispatched,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessStoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("process not found: {0}")]
    NotFound(ProcessId),
    #[error("invalid process row: {0}")]
    InvalidRow(String),
}

/// SQLite table of [`ProcessState`] records.
#[derive(Debug, Clone)]
pub struct ProcessStore {
    pool: SqlitePool,
}

impl ProcessStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, state), fields(process_id = %state.process_id, slice = %state.target_slice), err)]
    pub async fn create(&self, state: &ProcessState) -> Result<(), ProcessStoreError> {
        let batch_json = encode_batch(state.batch_job_id.as_ref())?;

        sqlx::query(
            r#"
            INSERT INTO process_states (
                process_id,
                target_slice,
                input_reference,
                batch_job_id,
                current_phase,
                created_at,
                updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(state.process_id.to_string())
        .bind(&state.target_slice)
        .bind(&state.input_reference)
        .bind(batch_json)
        .bind(state.phase)
        .bind(state.created_at)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_state", e))?;

        Ok(())
    }

    pub async fn get(&self, process_id: ProcessId) -> Result<Option<ProcessState>, ProcessStoreError> {
        let row = sqlx::query(
            r#"
            SELECT process_id, target_slice, input_reference, batch_job_id, current_phase, created_at, updated_at
            FROM process_states
            WHERE process_id = ?1
            "#,
        )
        .bind(process_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_state", e))?;

        row.map(|r| row_to_state(&r)).transpose()
    }

    #[instrument(skip(self), fields(process_id = %process_id, phase = %phase), err)]
    pub async fn update_phase(
        &self,
        process_id: ProcessId,
        phase: ProcessPhase,
    ) -> Result<(), ProcessStoreError> {
        let result = sqlx::query(
            "UPDATE process_states SET current_phase = ?2, updated_at = ?3 WHERE process_id = ?1",
        )
        .bind(process_id.to_string())
        .bind(phase)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_phase", e))?;

        if result.rows_affected() == 0 {
            return Err(ProcessStoreError::NotFound(process_id));
        }
        Ok(())
    }

    pub async fn set_batch_job_id(
        &self,
        process_id: ProcessId,
        batch_job_id: &BatchJobId,
    ) -> Result<(), ProcessStoreError> {
        let batch_json = encode_batch(Some(batch_job_id))?;
        let result = sqlx::query(
            "UPDATE process_states SET batch_job_id = ?2, updated_at = ?3 WHERE process_id = ?1",
        )
        .bind(process_id.to_string())
        .bind(batch_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_batch_job_id", e))?;

        if result.rows_affected() == 0 {
            return Err(ProcessStoreError::NotFound(process_id));
        }
        Ok(())
    }

    /// Remove the record. Returns `false` if there was none.
    #[instrument(skip(self), fields(process_id = %process_id), err)]
    pub async fn delete(&self, process_id: ProcessId) -> Result<bool, ProcessStoreError> {
        let result = sqlx::query("DELETE FROM process_states WHERE process_id = ?1")
            .bind(process_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_state", e))?;

        Ok(result.rows_affected() > 0)
    }

    /// Every resumable record, oldest first.
    #[instrument(skip(self), err)]
    pub async fn list_active(&self) -> Result<Vec<ProcessState>, ProcessStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT process_id, target_slice, input_reference, batch_job_id, current_phase, created_at, updated_at
            FROM process_states
            WHERE current_phase IN (?1, ?2)
            ORDER BY created_at ASC
            "#,
        )
        .bind(ProcessPhase::Dispatched)
        .bind(ProcessPhase::PendingCallback)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_active", e))?;

        let states = rows.iter().map(row_to_state).collect::<Result<Vec<_>, _>>()?;
        debug!(active = states.len(), "active processes listed");
        Ok(states)
    }
}

fn encode_batch(batch: Option<&BatchJobId>) -> Result<Option<String>, ProcessStoreError> {
    batch
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| ProcessStoreError::InvalidRow(format!("batch handle: {e}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ProcessStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            ProcessStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        other => ProcessStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

#[derive(Debug)]
struct StateRow {
    process_id: String,
    target_slice: String,
    input_reference: String,
    batch_job_id: Option<String>,
    current_phase: ProcessPhase,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StateRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StateRow {
            process_id: row.try_get("process_id")?,
            target_slice: row.try_get("target_slice")?,
            input_reference: row.try_get("input_reference")?,
            batch_job_id: row.try_get("batch_job_id")?,
            current_phase: row.try_get("current_phase")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn row_to_state(row: &SqliteRow) -> Result<ProcessState, ProcessStoreError> {
    let raw = StateRow::from_row(row)
        .map_err(|e| ProcessStoreError::InvalidRow(format!("failed to read process row: {e}")))?;
    let process_id = ProcessId::from_str(&raw.process_id)
        .map_err(|e| ProcessStoreError::InvalidRow(e.to_string()))?;
    let batch_job_id = raw
        .batch_job_id
        .as_deref()
        .map(serde_json::from_str::<BatchJobId>)
        .transpose()
        .map_err(|e| ProcessStoreError::InvalidRow(format!("process {process_id}: bad batch handle: {e}")))?;

    Ok(ProcessState {
        process_id,
        target_slice: raw.target_slice,
        input_reference: raw.input_reference,
        batch_job_id,
        phase: raw.current_phase,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn store() -> ProcessStore {
        let pool = db::in_memory().await.unwrap();
        db::migrate(&pool).await.unwrap();
        ProcessStore::new(pool)
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = store().await;
        let state = ProcessState::dispatched(ProcessId::new(), "npc", "data/npcs.json");
        store.create(&state).await.unwrap();

        let loaded = store.get(state.process_id).await.unwrap().unwrap();
        assert_eq!(loaded.target_slice, "npc");
        assert_eq!(loaded.input_reference, "data/npcs.json");
        assert_eq!(loaded.phase, ProcessPhase::Dispatched);
        assert!(loaded.batch_job_id.is_none());
    }

    #[tokio::test]
    async fn list_active_excludes_failed() {
        let store = store().await;
        let a = ProcessState::dispatched(ProcessId::new(), "npc", "a");
        let b = ProcessState::dispatched(ProcessId::new(), "npc", "b");
        let c = ProcessState::dispatched(ProcessId::new(), "npc", "c");
        for s in [&a, &b, &c] {
            store.create(s).await.unwrap();
        }
        store.update_phase(b.process_id, ProcessPhase::PendingCallback).await.unwrap();
        store.update_phase(c.process_id, ProcessPhase::Failed).await.unwrap();

        let mut active: Vec<ProcessId> = store
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.process_id)
            .collect();
        active.sort_by_key(|id| id.to_string());
        let mut expected = vec![a.process_id, b.process_id];
        expected.sort_by_key(|id| id.to_string());

        assert_eq!(active, expected);
    }

    #[tokio::test]
    async fn batch_handle_is_recorded() {
        let store = store().await;
        let state = ProcessState::dispatched(ProcessId::new(), "npc", "a");
        store.create(&state).await.unwrap();

        let handle = BatchJobId::new("b-7", "hosted");
        store.set_batch_job_id(state.process_id, &handle).await.unwrap();

        let loaded = store.get(state.process_id).await.unwrap().unwrap();
        assert_eq!(loaded.batch_job_id, Some(handle));
    }

    #[tokio::test]
    async fn missing_process_is_not_found() {
        let store = store().await;
        let id = ProcessId::new();

        assert!(store.get(id).await.unwrap().is_none());
        assert!(matches!(
            store.update_phase(id, ProcessPhase::Failed).await,
            Err(ProcessStoreError::NotFound(_))
        ));
        assert!(!store.delete(id).await.unwrap());
    }

    #[test]
    fn only_dispatched_and_pending_callback_resume() {
        assert!(ProcessPhase::Dispatched.is_resumable());
        assert!(ProcessPhase::PendingCallback.is_resumable());
        assert!(!ProcessPhase::Completed.is_resumable());
        assert!(!ProcessPhase::Failed.is_resumable());
    }
}
