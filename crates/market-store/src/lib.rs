//! Document store over sqlx/SQLite.
//!
//! One table per collection, unique keys enforced by primary keys, and
//! idempotent upserts per entity. Nested payloads (statements, task
//! parameters, results) are JSON text columns. The schema lives at the
//! workspace root and is executed statement-by-statement at startup.

pub mod bars;
pub mod basics;
pub mod financials;
pub mod notifications;
pub mod quotes;
pub mod sync_status;
pub mod tasks;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use market_core::StoreError;

pub use notifications::{NotificationPage, NotificationRow, MAX_PER_USER, RETAIN_DAYS};
pub use quotes::QuoteWrite;
pub use tasks::TaskPage;

/// Result of one batched write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub inserted: u64,
    pub updated: u64,
    /// Conditional upserts refused as stale (counted, never fatal).
    pub skipped: u64,
    pub errors: u64,
}

impl BatchResult {
    pub fn absorb(&mut self, other: BatchResult) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

#[derive(Clone)]
pub struct MarketStore {
    pool: SqlitePool,
}

impl MarketStore {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(map_sqlx)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let schema = include_str!("../../../schema.sql");
        for statement in schema.split(';') {
            let stmt = statement.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt)
                    .execute(&self.pool)
                    .await
                    .map_err(map_sqlx)?;
            }
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn map_sqlx(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(e.to_string())
        }
        other => StoreError::Query(other.to_string()),
    }
}

/// Retry a batched write on store unavailability: three attempts with
/// 2 s / 4 s / 8 s backoff. Residual failure is the caller's error count.
pub async fn with_store_retry<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut last_err = None;
    for attempt in 0..3u32 {
        match op().await {
            Ok(value) => return Ok(value),
            Err(StoreError::Unavailable(msg)) => {
                let wait = Duration::from_secs(2 << attempt);
                tracing::warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    wait_secs = wait.as_secs(),
                    "[WARN] store write timed out, retrying"
                );
                tokio::time::sleep(wait).await;
                last_err = Some(StoreError::Unavailable(msg));
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| StoreError::Unavailable("retries exhausted".to_string())))
}

// Column codecs shared by the repositories. Timestamps are RFC 3339 UTC;
// trade dates are bare exchange-local dates.

pub(crate) fn ts_to_col(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn ts_from_col(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn date_to_col(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn date_from_col(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

#[cfg(test)]
pub(crate) async fn memory_store() -> MarketStore {
    MarketStore::new("sqlite::memory:")
        .await
        .expect("in-memory store")
}
