//! Durable launch storage: transactional keyed upserts into `raw.launches`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use launch_core::{PendingRow, StoredLaunch};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "launch-store";

pub const LAUNCHES_TABLE: &str = "raw.launches";

/// Rows per `INSERT` statement inside the run transaction.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Two binds per row; Postgres caps a statement at 65535 bind parameters.
pub const MAX_BATCH_SIZE: usize = u16::MAX as usize / 2;

pub fn clamp_batch_size(batch_size: usize) -> usize {
    batch_size.clamp(1, MAX_BATCH_SIZE)
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Keyed document store. `upsert` is all-or-nothing per call.
#[async_trait]
pub trait LaunchStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Insert each row, or overwrite payload and refresh `ingested_at` when the
    /// id already exists. Rows must carry distinct ids.
    async fn upsert(&self, rows: &[PendingRow]) -> Result<u64, PersistenceError>;

    async fn get(&self, id: &str) -> Result<Option<StoredLaunch>, PersistenceError>;

    async fn count(&self) -> Result<u64, PersistenceError>;
}

#[async_trait]
impl<T: LaunchStore + ?Sized> LaunchStore for Arc<T> {
    fn backend(&self) -> &'static str {
        (**self).backend()
    }

    async fn upsert(&self, rows: &[PendingRow]) -> Result<u64, PersistenceError> {
        (**self).upsert(rows).await
    }

    async fn get(&self, id: &str) -> Result<Option<StoredLaunch>, PersistenceError> {
        (**self).get(id).await
    }

    async fn count(&self) -> Result<u64, PersistenceError> {
        (**self).count().await
    }
}

#[derive(Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub acquire_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            user: "de".to_string(),
            password: "de_password".to_string(),
            database: "de_raw".to_string(),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

// Password stays out of logs.
impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

impl PostgresConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }
}

#[derive(Debug, Clone)]
pub struct PgLaunchStore {
    pool: PgPool,
    batch_size: usize,
}

impl PgLaunchStore {
    /// One pooled connection: the whole run is a single transaction.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(config.connect_options())
            .await?;
        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            "connected to postgres"
        );
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = clamp_batch_size(batch_size);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        debug!("schema migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl LaunchStore for PgLaunchStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn upsert(&self, rows: &[PendingRow]) -> Result<u64, PersistenceError> {
        if rows.is_empty() {
            return Ok(0);
        }

        // Dropping `tx` on an early return rolls back every chunk written so far.
        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;

        for chunk in rows.chunks(self.batch_size) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {LAUNCHES_TABLE} (id, payload) "));
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.id.clone())
                    .push_bind(Json(row.payload.clone()));
            });
            qb.push(
                " ON CONFLICT (id) DO UPDATE \
                 SET payload = EXCLUDED.payload, \
                     ingested_at = now()",
            );

            let result = qb.build().execute(&mut *tx).await?;
            affected += result.rows_affected();
            debug!(chunk_rows = chunk.len(), "upserted chunk");
        }

        tx.commit().await?;
        Ok(affected)
    }

    async fn get(&self, id: &str) -> Result<Option<StoredLaunch>, PersistenceError> {
        let row = sqlx::query(&format!(
            "SELECT id, payload, ingested_at FROM {LAUNCHES_TABLE} WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: Json<JsonValue> = row.try_get("payload")?;
        Ok(Some(StoredLaunch {
            id: row.try_get("id")?,
            payload: payload.0,
            ingested_at: row.try_get("ingested_at")?,
        }))
    }

    async fn count(&self) -> Result<u64, PersistenceError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {LAUNCHES_TABLE}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

/// In-process store with the same transactional contract as [`PgLaunchStore`].
///
/// Writes are staged on a copy of the table and swapped in only when every
/// row succeeded. `fail_on_id` rejects the write when that id is reached,
/// after earlier rows of the same call were already staged.
#[derive(Debug)]
pub struct MemoryLaunchStore {
    rows: Mutex<BTreeMap<String, StoredLaunch>>,
    batch_size: usize,
    fail_on_id: Option<String>,
    write_attempts: AtomicUsize,
}

impl Default for MemoryLaunchStore {
    fn default() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            batch_size: DEFAULT_BATCH_SIZE,
            fail_on_id: None,
            write_attempts: AtomicUsize::new(0),
        }
    }
}

impl MemoryLaunchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = clamp_batch_size(batch_size);
        self
    }

    pub fn failing_on(mut self, id: impl Into<String>) -> Self {
        self.fail_on_id = Some(id.into());
        self
    }

    /// Number of `upsert` calls that reached the store, including rejected ones.
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> BTreeMap<String, StoredLaunch> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl LaunchStore for MemoryLaunchStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, rows: &[PendingRow]) -> Result<u64, PersistenceError> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.write_attempts.fetch_add(1, Ordering::SeqCst);

        let mut table = self.rows.lock().await;
        let mut staged = table.clone();
        let written_at = Utc::now();
        let mut affected = 0u64;

        for chunk in rows.chunks(self.batch_size) {
            for row in chunk {
                if self.fail_on_id.as_deref() == Some(row.id.as_str()) {
                    return Err(PersistenceError::Rejected(format!(
                        "injected failure on id {}",
                        row.id
                    )));
                }
                staged.insert(
                    row.id.clone(),
                    StoredLaunch {
                        id: row.id.clone(),
                        payload: row.payload.clone(),
                        ingested_at: written_at,
                    },
                );
                affected += 1;
            }
        }

        *table = staged;
        Ok(affected)
    }

    async fn get(&self, id: &str) -> Result<Option<StoredLaunch>, PersistenceError> {
        Ok(self.rows.lock().await.get(id).cloned())
    }

    async fn count(&self) -> Result<u64, PersistenceError> {
        Ok(self.rows.lock().await.len() as u64)
    }
}
