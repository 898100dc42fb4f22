//! Ingest pipeline orchestration: fetch the dataset, then upsert it in one transaction.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use launch_core::plan_upsert;
use launch_fetch::{HttpClientConfig, HttpFetcher, DEFAULT_SOURCE_URL};
use launch_store::{LaunchStore, PgLaunchStore, PostgresConfig, DEFAULT_BATCH_SIZE};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "launch-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub source_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub batch_size: usize,
    pub auto_migrate: bool,
    pub postgres: PostgresConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            http_timeout_secs: 60,
            user_agent: "launch-ingest/0.1".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            auto_migrate: true,
            postgres: PostgresConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset keys fall back to defaults; set but malformed keys are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let text = |key: &str, fallback: String| lookup(key).unwrap_or(fallback);

        Ok(Self {
            source_url: text("LAUNCH_SOURCE_URL", defaults.source_url),
            http_timeout_secs: parse_var(&lookup, "LAUNCH_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
            user_agent: text("LAUNCH_USER_AGENT", defaults.user_agent),
            batch_size: parse_var(&lookup, "LAUNCH_BATCH_SIZE", defaults.batch_size)?.max(1),
            auto_migrate: match lookup("LAUNCH_AUTO_MIGRATE") {
                Some(value) => parse_flag("LAUNCH_AUTO_MIGRATE", value)?,
                None => defaults.auto_migrate,
            },
            postgres: PostgresConfig {
                host: text("POSTGRES_DATA_HOST", defaults.postgres.host),
                port: parse_var(&lookup, "POSTGRES_DATA_PORT", defaults.postgres.port)?,
                user: text("POSTGRES_DATA_USER", defaults.postgres.user),
                password: text("POSTGRES_DATA_PASSWORD", defaults.postgres.password),
                database: text("POSTGRES_DATA_DB", defaults.postgres.database),
                acquire_timeout: defaults.postgres.acquire_timeout,
            },
        })
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    fallback: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            key,
            reason: err.to_string(),
            value,
        }),
        None => Ok(fallback),
    }
}

fn parse_flag(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value,
            reason: "expected true or false".to_string(),
        }),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_url: String,
    pub fetched: usize,
    pub skipped_without_id: usize,
    pub superseded: usize,
    pub upserted: u64,
    pub stored_total: u64,
}

pub struct IngestPipeline {
    config: IngestConfig,
    http: HttpFetcher,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self { config, http })
    }

    /// Run one ingest. `open_store` is only called once the fetch succeeded,
    /// so a failed fetch never touches storage.
    pub async fn run_once<S, F, Fut>(&self, open_store: F) -> Result<IngestRunSummary>
    where
        S: LaunchStore,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let source_url = self.config.source_url.clone();

        async move {
            let records = self
                .http
                .fetch_records(run_id, &source_url)
                .await
                .with_context(|| format!("fetching {source_url}"))?;
            let fetched = records.len();

            let plan = plan_upsert(records);
            if plan.skipped_without_id > 0 {
                warn!(
                    skipped = plan.skipped_without_id,
                    "dropping records without an id"
                );
            }
            if plan.superseded > 0 {
                info!(
                    superseded = plan.superseded,
                    "repeated ids resolved to their last occurrence"
                );
            }

            let store = open_store().await.context("opening launch store")?;
            let upserted = store
                .upsert(&plan.rows)
                .instrument(info_span!("upsert", backend = store.backend(), rows = plan.len()))
                .await
                .context("upserting launches")?;
            let stored_total = store
                .count()
                .await
                .context("counting stored launches")?;

            let finished_at = Utc::now();
            info!(fetched, upserted, stored_total, "ingest run complete");

            Ok(IngestRunSummary {
                run_id,
                started_at,
                finished_at,
                source_url,
                fetched,
                skipped_without_id: plan.skipped_without_id,
                superseded: plan.superseded,
                upserted,
                stored_total,
            })
        }
        .instrument(info_span!("ingest_run", %run_id))
        .await
    }
}

async fn open_postgres_store(config: &IngestConfig) -> Result<PgLaunchStore> {
    let store = PgLaunchStore::connect(&config.postgres)
        .await
        .context("connecting to postgres")?
        .with_batch_size(config.batch_size);
    if config.auto_migrate {
        store.migrate().await.context("applying schema migrations")?;
    }
    Ok(store)
}

pub async fn run_ingest_once_from_env() -> Result<IngestRunSummary> {
    let config = IngestConfig::from_env()?;
    let pipeline = IngestPipeline::new(config.clone())?;
    pipeline.run_once(|| open_postgres_store(&config)).await
}

pub async fn run_migrations_from_env() -> Result<()> {
    let config = IngestConfig::from_env()?;
    let store = PgLaunchStore::connect(&config.postgres)
        .await
        .context("connecting to postgres")?;
    store.migrate().await.context("applying schema migrations")?;
    store.close().await;
    Ok(())
}
