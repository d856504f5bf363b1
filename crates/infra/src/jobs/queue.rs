//! Durable job queue backed by SQLite.

use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};
use tracing::{debug, instrument};

use batchloom_core::{BatchJobId, JobId, LlmRequest, ProcessId};

use super::types::{Job, JobQueueError, JobStats, JobStatus, JobUpdate};

const JOB_COLUMNS: &str = r#"
    id,
    process_id,
    position,
    request_json,
    status,
    batch_job_id,
    response_json,
    error_message,
    created_at,
    updated_at
"#;

/// Persistent table of LLM jobs grouped by process.
///
/// Every operation is a single statement or a single transaction; the queue
/// holds no in-memory state, so it is cheap to clone and share.
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: SqlitePool,
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert one Pending job per request, all or nothing.
    ///
    /// Returned ids are in request order.
    #[instrument(skip(self, requests), fields(process_id = %process_id, count = requests.len()), err)]
    pub async fn submit_jobs(
        &self,
        process_id: ProcessId,
        requests: &[LlmRequest],
    ) -> Result<Vec<JobId>, JobQueueError> {
        let started = Instant::now();
        let now = Utc::now();
        let mut ids = Vec::with_capacity(requests.len());
        let encoded = requests
            .iter()
            .enumerate()
            .map(|(position, request)| encode_request(position, request))
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_submit", e))?;

        for (position, request_json) in encoded.into_iter().enumerate() {
            // an early return drops `tx`, which rolls the whole group back
            let id = JobId::new();

            sqlx::query(
                r#"
                INSERT INTO llm_jobs (
                    id,
                    process_id,
                    position,
                    request_json,
                    status,
                    batch_job_id,
                    response_json,
                    error_message,
                    created_at,
                    updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL, ?6, ?6)
                "#,
            )
            .bind(id.to_string())
            .bind(process_id.to_string())
            .bind(position as i64)
            .bind(request_json)
            .bind(JobStatus::Pending)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_job", e))?;

            ids.push(id);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_submit", e))?;

        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "jobs submitted");
        Ok(ids)
    }

    /// Jobs of `process_id` in `status`, in submission order.
    #[instrument(skip(self), fields(process_id = %process_id, status = %status), err)]
    pub async fn jobs_by_status(
        &self,
        process_id: ProcessId,
        status: JobStatus,
    ) -> Result<Vec<Job>, JobQueueError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM llm_jobs WHERE process_id = ?1 AND status = ?2 ORDER BY position ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(process_id.to_string())
            .bind(status)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("jobs_by_status", e))?;

        let jobs = rows_to_jobs(rows)?;
        debug!(found = jobs.len(), "jobs loaded");
        Ok(jobs)
    }

    /// Every job of `process_id` regardless of status, in submission order.
    #[instrument(skip(self), fields(process_id = %process_id), err)]
    pub async fn results(&self, process_id: ProcessId) -> Result<Vec<Job>, JobQueueError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM llm_jobs WHERE process_id = ?1 ORDER BY position ASC");
        let rows = sqlx::query(&sql)
            .bind(process_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("results", e))?;

        let jobs = rows_to_jobs(rows)?;
        debug!(found = jobs.len(), "results loaded");
        Ok(jobs)
    }

    /// Apply one status transition. Fails with `NotFound` if no row has that id.
    #[instrument(skip(self, update), fields(job_id = %update.id, status = %update.status), err)]
    pub async fn update_job(&self, update: JobUpdate) -> Result<(), JobQueueError> {
        let batch_json = update
            .batch_job_id
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| JobQueueError::Serialization(format!("batch handle: {e}")))?;
        let response_json = update
            .response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| JobQueueError::Serialization(format!("response: {e}")))?;

        let result = sqlx::query(
            r#"
            UPDATE llm_jobs
            SET status = ?2,
                batch_job_id = COALESCE(?3, batch_job_id),
                response_json = ?4,
                error_message = ?5,
                updated_at = ?6
            WHERE id = ?1
            "#,
        )
        .bind(update.id.to_string())
        .bind(update.status)
        .bind(batch_json)
        .bind(response_json)
        .bind(update.error_message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 0 {
            return Err(JobQueueError::NotFound(update.id));
        }
        Ok(())
    }

    /// Hard-delete every job of `process_id`. Returns the number removed.
    #[instrument(skip(self), fields(process_id = %process_id), err)]
    pub async fn delete_jobs(&self, process_id: ProcessId) -> Result<u64, JobQueueError> {
        let result = sqlx::query("DELETE FROM llm_jobs WHERE process_id = ?1")
            .bind(process_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_jobs", e))?;

        debug!(deleted = result.rows_affected(), "jobs deleted");
        Ok(result.rows_affected())
    }

    /// Move every InProgress job, across all processes, back to Pending.
    #[instrument(skip(self), err)]
    pub async fn reset_in_progress(&self) -> Result<u64, JobQueueError> {
        let result = sqlx::query("UPDATE llm_jobs SET status = ?1, updated_at = ?2 WHERE status = ?3")
            .bind(JobStatus::Pending)
            .bind(Utc::now())
            .bind(JobStatus::InProgress)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("reset_in_progress", e))?;

        debug!(reset = result.rows_affected(), "in-progress jobs reset");
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(process_id = %process_id), err)]
    pub async fn stats(&self, process_id: ProcessId) -> Result<JobStats, JobQueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM llm_jobs WHERE process_id = ?1 GROUP BY status")
            .bind(process_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: JobStatus = row
                .try_get("status")
                .map_err(|e| JobQueueError::InvalidRow(e.to_string()))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| JobQueueError::InvalidRow(e.to_string()))?;
            stats.add(status, n as usize);
        }
        Ok(stats)
    }
}

/// Serialize a request and make sure the stored form decodes again.
///
/// serde_json writes non-finite floats as `null`, which would leave a job the
/// worker can never read back.
fn encode_request(position: usize, request: &LlmRequest) -> Result<String, JobQueueError> {
    let json = serde_json::to_string(request)
        .map_err(|e| JobQueueError::Serialization(format!("request {position}: {e}")))?;
    serde_json::from_str::<LlmRequest>(&json)
        .map_err(|e| JobQueueError::Serialization(format!("request {position} does not decode: {e}")))?;
    Ok(json)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobQueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobQueueError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => JobQueueError::Storage(format!("connection pool closed in {operation}")),
        sqlx::Error::PoolTimedOut => {
            JobQueueError::Storage(format!("timed out waiting for a connection in {operation}"))
        }
        other => JobQueueError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn rows_to_jobs(rows: Vec<SqliteRow>) -> Result<Vec<Job>, JobQueueError> {
    let mut jobs = Vec::with_capacity(rows.len());
    for row in rows {
        let raw = JobRow::from_row(&row)
            .map_err(|e| JobQueueError::InvalidRow(format!("failed to read job row: {e}")))?;
        jobs.push(Job::try_from(raw)?);
    }
    Ok(jobs)
}

#[derive(Debug)]
struct JobRow {
    id: String,
    process_id: String,
    position: i64,
    request_json: String,
    status: JobStatus,
    batch_job_id: Option<String>,
    response_json: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for JobRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            process_id: row.try_get("process_id")?,
            position: row.try_get("position")?,
            request_json: row.try_get("request_json")?,
            status: row.try_get("status")?,
            batch_job_id: row.try_get("batch_job_id")?,
            response_json: row.try_get("response_json")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobQueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = JobId::from_str(&row.id).map_err(|e| JobQueueError::InvalidRow(e.to_string()))?;
        let process_id =
            ProcessId::from_str(&row.process_id).map_err(|e| JobQueueError::InvalidRow(e.to_string()))?;
        let batch_job_id = row
            .batch_job_id
            .as_deref()
            .map(serde_json::from_str::<BatchJobId>)
            .transpose()
            .map_err(|e| JobQueueError::InvalidRow(format!("job {id}: bad batch handle: {e}")))?;

        Ok(Job {
            id,
            process_id,
            position: row.position as u32,
            request_json: row.request_json,
            status: row.status,
            batch_job_id,
            response_json: row.response_json,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchloom_core::LlmResponse;
    use proptest::prelude::*;

    use crate::db;

    async fn queue() -> JobQueue {
        let pool = db::in_memory().await.unwrap();
        db::migrate(&pool).await.unwrap();
        JobQueue::new(pool)
    }

    fn requests(n: usize) -> Vec<LlmRequest> {
        (0..n)
            .map(|i| LlmRequest::new("sys", format!("prompt {i}")).with_metadata("n", i as u64))
            .collect()
    }

    #[tokio::test]
    async fn submitted_jobs_are_pending_in_order() {
        let queue = queue().await;
        let pid = ProcessId::new();

        let ids = queue.submit_jobs(pid, &requests(3)).await.unwrap();
        let pending = queue.jobs_by_status(pid, JobStatus::Pending).await.unwrap();

        assert_eq!(pending.len(), 3);
        assert_eq!(pending.iter().map(|j| j.id).collect::<Vec<_>>(), ids);
        for (i, job) in pending.iter().enumerate() {
            assert_eq!(job.position as usize, i);
            assert_eq!(job.request().unwrap().user_prompt, format!("prompt {i}"));
        }
    }

    #[tokio::test]
    async fn groups_are_isolated_by_process() {
        let queue = queue().await;
        let a = ProcessId::new();
        let b = ProcessId::new();
        queue.submit_jobs(a, &requests(2)).await.unwrap();
        queue.submit_jobs(b, &requests(1)).await.unwrap();

        assert_eq!(queue.results(a).await.unwrap().len(), 2);
        assert_eq!(queue.results(b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_records_terminal_outcome() {
        let queue = queue().await;
        let pid = ProcessId::new();
        let ids = queue.submit_jobs(pid, &requests(2)).await.unwrap();

        queue
            .update_job(JobUpdate::completed(ids[0], LlmResponse::success("ok")))
            .await
            .unwrap();
        queue.update_job(JobUpdate::failed(ids[1], "rate limited")).await.unwrap();

        let jobs = queue.results(pid).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Completed);
        assert_eq!(jobs[0].response().unwrap().unwrap().content, "ok");
        assert!(jobs[0].error_message.is_none());
        assert_eq!(jobs[1].status, JobStatus::Failed);
        assert_eq!(jobs[1].error_message.as_deref(), Some("rate limited"));
        assert!(jobs[1].response().unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_handle_survives_later_updates() {
        let queue = queue().await;
        let pid = ProcessId::new();
        let ids = queue.submit_jobs(pid, &requests(1)).await.unwrap();
        let handle = BatchJobId::new("batch-1", "hosted");

        queue.update_job(JobUpdate::in_batch(ids[0], handle.clone())).await.unwrap();
        queue
            .update_job(JobUpdate::completed(ids[0], LlmResponse::success("done")))
            .await
            .unwrap();

        let job = &queue.results(pid).await.unwrap()[0];
        assert_eq!(job.batch_job_id.as_ref(), Some(&handle));
    }

    #[tokio::test]
    async fn update_unknown_job_is_not_found() {
        let queue = queue().await;
        let missing = JobId::new();

        let err = queue.update_job(JobUpdate::in_progress(missing)).await.unwrap_err();
        assert!(matches!(err, JobQueueError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn delete_empty_group_returns_zero() {
        let queue = queue().await;
        assert_eq!(queue.delete_jobs(ProcessId::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_removes_whole_group() {
        let queue = queue().await;
        let pid = ProcessId::new();
        queue.submit_jobs(pid, &requests(4)).await.unwrap();

        assert_eq!(queue.delete_jobs(pid).await.unwrap(), 4);
        assert!(queue.results(pid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_only_touches_in_progress() {
        let queue = queue().await;
        let pid = ProcessId::new();
        let ids = queue.submit_jobs(pid, &requests(4)).await.unwrap();

        queue.update_job(JobUpdate::in_progress(ids[0])).await.unwrap();
        queue.update_job(JobUpdate::in_progress(ids[1])).await.unwrap();
        queue
            .update_job(JobUpdate::completed(ids[2], LlmResponse::success("x")))
            .await
            .unwrap();

        assert_eq!(queue.reset_in_progress().await.unwrap(), 2);

        let stats = queue.stats(pid).await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.in_progress, 0);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total(), 4);
    }

    #[tokio::test]
    async fn undecodable_request_rejects_whole_group() {
        let queue = queue().await;
        let pid = ProcessId::new();
        let mut reqs = requests(3);
        reqs[2] = reqs[2].clone().with_temperature(f32::NAN);

        let err = queue.submit_jobs(pid, &reqs).await.unwrap_err();

        assert!(matches!(err, JobQueueError::Serialization(msg) if msg.starts_with("request 2")));
        assert!(queue.results(pid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_insert_rolls_back_earlier_rows() {
        let queue = queue().await;
        let pid = ProcessId::new();
        sqlx::query(
            r#"
            CREATE TRIGGER reject_second_job BEFORE INSERT ON llm_jobs
            WHEN NEW.position = 1
            BEGIN
                SELECT RAISE(ABORT, 'second job rejected');
            END
            "#,
        )
        .execute(queue.pool())
        .await
        .unwrap();

        let err = queue.submit_jobs(pid, &requests(3)).await.unwrap_err();

        assert!(matches!(err, JobQueueError::Storage(msg) if msg.contains("second job rejected")));
        assert!(queue.results(pid).await.unwrap().is_empty());
        assert_eq!(queue.stats(pid).await.unwrap().total(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn retrieval_order_matches_submission(prompts in proptest::collection::vec("[a-z ]{0,12}", 0..20)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let stored: Vec<String> = rt.block_on(async {
                let queue = queue().await;
                let pid = ProcessId::new();
                let reqs: Vec<LlmRequest> = prompts.iter().map(|p| LlmRequest::new("", p.clone())).collect();
                queue.submit_jobs(pid, &reqs).await.unwrap();
                queue
                    .results(pid)
                    .await
                    .unwrap()
                    .iter()
                    .map(|j| j.request().unwrap().user_prompt)
                    .collect()
            });

            prop_assert_eq!(stored, prompts);
        }
    }
}
