//! SQLite connection setup and schema migrations.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::{debug, info};

/// Connection settings for the job database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx SQLite URL, e.g. `sqlite://batchloom.db` or `sqlite::memory:`.
    pub url: String,
    pub max_connections: u32,
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://batchloom.db".to_string(),
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl DatabaseConfig {
    pub fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

/// Open a pool for `config` and bring the schema up to date.
pub async fn open(config: &DatabaseConfig) -> anyhow::Result<SqlitePool> {
    let pool = if config.is_in_memory() {
        in_memory().await?
    } else {
        connect(config).await?
    };
    migrate(&pool).await?;
    Ok(pool)
}

/// Connect to a file database in WAL mode.
pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)
        .with_context(|| format!("invalid database url {:?}", config.url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(config.busy_timeout)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open SQLite database at {:?}", config.url))?;

    info!(url = %config.url, "database opened");
    Ok(pool)
}

/// Private in-memory database.
///
/// Every connection to `sqlite::memory:` is a separate database, so the pool
/// is pinned to one connection that never expires.
pub async fn in_memory() -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .context("invalid in-memory database url")?
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .context("failed to open in-memory SQLite database")
}

const MIGRATIONS: &[(i64, &[&str])] = &[(
    1,
    &[
        r#"
        CREATE TABLE IF NOT EXISTS llm_jobs (
            id             TEXT PRIMARY KEY,
            process_id     TEXT NOT NULL,
            position       INTEGER NOT NULL,
            request_json   TEXT NOT NULL,
            status         TEXT NOT NULL,
            batch_job_id   TEXT NULL,
            response_json  TEXT NULL,
            error_message  TEXT NULL,
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_llm_jobs_process ON llm_jobs (process_id, position)",
        "CREATE INDEX IF NOT EXISTS idx_llm_jobs_status ON llm_jobs (status)",
        r#"
        CREATE TABLE IF NOT EXISTS process_states (
            process_id       TEXT PRIMARY KEY,
            target_slice     TEXT NOT NULL,
            input_reference  TEXT NOT NULL,
            batch_job_id     TEXT NULL,
            current_phase    TEXT NOT NULL,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        )
        "#,
    ],
)];

/// Apply every migration newer than the recorded schema version.
pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create schema_version table")?;

    let current: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .fetch_one(pool)
        .await
        .context("failed to read schema version")?;

    for (version, statements) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        let mut tx = pool.begin().await.context("failed to begin migration")?;
        for statement in *statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("migration {version} failed"))?;
        }
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)")
            .bind(*version)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to record migration {version}"))?;
        tx.commit()
            .await
            .with_context(|| format!("failed to commit migration {version}"))?;

        debug!(version, "migration applied");
    }

    Ok(())
}

/// Latest schema version this build knows about.
pub fn latest_schema_version() -> i64 {
    MIGRATIONS.last().map(|(v, _)| *v).unwrap_or(0)
}
