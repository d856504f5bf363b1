//! Engine configuration, loaded once at startup.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use batchloom_core::BulkStrategy;
use batchloom_llm::RetryPolicy;

use crate::db::DatabaseConfig;
use crate::pipeline::PipelineConfig;
use crate::worker::WorkerConfig;

pub const ENV_DB_URL: &str = "BATCHLOOM_DB_URL";
pub const ENV_PROVIDER: &str = "BATCHLOOM_PROVIDER";
pub const ENV_BULK_STRATEGY: &str = "BATCHLOOM_BULK_STRATEGY";
pub const ENV_SYNC_CONCURRENCY: &str = "BATCHLOOM_SYNC_CONCURRENCY";
pub const ENV_POLL_INTERVAL_MS: &str = "BATCHLOOM_POLL_INTERVAL_MS";
pub const ENV_SUPERVISORS: &str = "BATCHLOOM_SUPERVISORS";
pub const ENV_RETRY_MAX_ATTEMPTS: &str = "BATCHLOOM_RETRY_MAX_ATTEMPTS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub pipeline: PipelineConfig,
    /// Applied to every provider client registered without its own policy.
    pub retry: RetryPolicy,
}

impl EngineConfig {
    /// Defaults overridden by `BATCHLOOM_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = non_empty(&lookup, ENV_DB_URL) {
            config.database.url = url;
        }
        if let Some(provider) = non_empty(&lookup, ENV_PROVIDER) {
            config.worker.provider = provider;
        }
        if let Some(strategy) = parse_var::<BulkStrategy, _>(&lookup, ENV_BULK_STRATEGY) {
            config.worker.strategy = strategy;
        }
        if let Some(concurrency) = parse_var::<usize, _>(&lookup, ENV_SYNC_CONCURRENCY) {
            config.worker.concurrency = Some(concurrency);
        }
        match parse_var::<u64, _>(&lookup, ENV_POLL_INTERVAL_MS) {
            Some(0) => warn!(key = ENV_POLL_INTERVAL_MS, "poll interval must be positive; using default"),
            Some(ms) => config.worker.poll_interval = Duration::from_millis(ms),
            None => {}
        }
        match parse_var::<usize, _>(&lookup, ENV_SUPERVISORS) {
            Some(0) => warn!(key = ENV_SUPERVISORS, "supervisor count must be positive; using default"),
            Some(n) => config.pipeline.supervisors = n,
            None => {}
        }
        if let Some(attempts) = parse_var::<u32, _>(&lookup, ENV_RETRY_MAX_ATTEMPTS) {
            config.retry.max_attempts = attempts;
        }

        config
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = non_empty(lookup, key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, value = %raw, error = %err, "invalid configuration value; using default");
            None
        }
    }
}
