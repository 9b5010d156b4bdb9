//! Append-only time-series store with SQLite persistence.
//!
//! One row per sample in the `metrics` table. Writes are serialized behind a single
//! lock so timestamps stay non-decreasing in insertion order; reads go straight to
//! the pool and, with WAL enabled, never wait on a writer.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::StoreError;
use crate::types::{MetricColumn, PersistedRow, Point};

pub const MIN_LIMIT: u32 = 1;
pub const MAX_LIMIT: u32 = 2000;
pub const DEFAULT_LIMIT: u32 = 500;
pub const DEFAULT_WINDOW_MS: i64 = 60 * 60 * 1000;

const SCHEMA_VERSION: i64 = 1;

/// An inclusive `[since_ms, until_ms]` window, already clamped to `[0, now]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub since_ms: i64,
    pub until_ms: i64,
}

impl TimeWindow {
    /// Absent bounds default to the last hour ending at `now_ms`.
    pub fn clamped(since_ms: Option<i64>, until_ms: Option<i64>, now_ms: i64) -> Self {
        let until_ms = until_ms.unwrap_or(now_ms).min(now_ms);
        let since_ms = since_ms.unwrap_or(now_ms - DEFAULT_WINDOW_MS).max(0);
        Self { since_ms, until_ms }
    }

    pub fn is_inverted(&self) -> bool {
        self.since_ms > self.until_ms
    }
}

pub fn clamp_limit(requested: Option<i64>) -> u32 {
    match requested {
        Some(n) => n.clamp(MIN_LIMIT as i64, MAX_LIMIT as i64) as u32,
        None => DEFAULT_LIMIT,
    }
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    // last timestamp written; holding it serializes appends
    write_lock: Arc<Mutex<i64>>,
    closed: Arc<AtomicBool>,
}

impl Store {
    #[instrument(skip(db_path))]
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        info!("Opening metrics store at {:?}", db_path);
        let open_err = |reason: String| StoreError::Open {
            path: db_path.display().to_string(),
            reason,
        };

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| open_err(format!("failed to create {}: {e}", parent.display())))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| open_err(e.to_string()))?;

        migrate(&pool).await?;

        let last: Option<i64> = sqlx::query_scalar("SELECT MAX(timestamp_ms) FROM metrics")
            .fetch_one(&pool)
            .await
            .map_err(|e| open_err(e.to_string()))?;

        info!("Metrics store ready");
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(last.unwrap_or(0))),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Insert one row and return its id. The stored timestamp is
    /// `max(row.timestamp_ms, last written)`.
    pub async fn append(&self, row: &PersistedRow) -> Result<i64, StoreError> {
        let mut last = self.write_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let ts = row.timestamp_ms.max(*last);

        let sql = insert_sql();
        let mut query = sqlx::query(&sql).bind(ts);
        for column in MetricColumn::ALL {
            query = query.bind(row.values.get(column));
        }
        let id = query
            .bind(&row.full_data)
            .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Write(e.to_string()))?
        .last_insert_rowid();

        *last = ts;
        Ok(id)
    }

    /// At most `limit` points inside `window` (inclusive), ascending by timestamp.
    #[instrument(skip(self))]
    pub async fn query_range(
        &self,
        window: TimeWindow,
        limit: u32,
        column: MetricColumn,
    ) -> Result<Vec<Point>, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        if window.is_inverted() {
            return Ok(Vec::new());
        }
        let limit = limit.clamp(MIN_LIMIT, MAX_LIMIT);

        // `column` comes from a closed enum, never from request text.
        let sql = format!(
            "SELECT timestamp_ms, {col} AS value FROM metrics \
             WHERE timestamp_ms BETWEEN ? AND ? \
             ORDER BY timestamp_ms ASC, id ASC LIMIT ?",
            col = column.as_str()
        );
        let rows = sqlx::query(&sql)
            .bind(window.since_ms)
            .bind(window.until_ms)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Read(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                Ok(Point {
                    timestamp: row
                        .try_get::<i64, _>("timestamp_ms")
                        .map_err(|e| StoreError::Read(e.to_string()))?,
                    value: row
                        .try_get::<Option<f64>, _>("value")
                        .map_err(|e| StoreError::Read(e.to_string()))?
                        .unwrap_or(0.0),
                })
            })
            .collect()
    }

    /// Delete rows strictly older than `cutoff_ms`.
    #[instrument(skip(self))]
    pub async fn purge_before(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let _serialized = self.write_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let deleted = sqlx::query("DELETE FROM metrics WHERE timestamp_ms < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?
            .rows_affected();
        if deleted > 0 {
            debug!(deleted, cutoff_ms, "Purged old metrics rows");
        }
        Ok(deleted)
    }

    #[cfg(test)]
    pub(crate) async fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metrics")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Read(e.to_string()))?;
        Ok(n as u64)
    }

    /// Raw audit payload of a row, as written.
    #[cfg(test)]
    pub(crate) async fn full_data(&self, id: i64) -> Result<Option<String>, StoreError> {
        sqlx::query_scalar("SELECT full_data FROM metrics WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Read(e.to_string()))
    }

    /// Waits for any in-flight append, then refuses further writes and closes the pool.
    pub async fn close(&self) {
        let _serialized = self.write_lock.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.close().await;
        info!("Metrics store closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// Columns and placeholders follow `MetricColumn::ALL` so the binds line up.
fn insert_sql() -> String {
    let columns: Vec<&str> = MetricColumn::ALL.iter().map(|c| c.as_str()).collect();
    format!(
        "INSERT INTO metrics (timestamp_ms, {}, full_data) VALUES (?, {}, ?)",
        columns.join(", "),
        vec!["?"; columns.len()].join(", ")
    )
}

#[instrument(skip(pool))]
async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    let fail = |e: sqlx::Error| StoreError::Migration(e.to_string());

    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)")
        .execute(pool)
        .await
        .map_err(fail)?;

    let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await
        .map_err(fail)?;
    let current = current.unwrap_or(0);

    if current >= SCHEMA_VERSION {
        debug!("Metrics schema is up to date (version {})", current);
        return Ok(());
    }
    info!("Migrating metrics schema from version {} to {}", current, SCHEMA_VERSION);

    let mut tx = pool.begin().await.map_err(fail)?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp_ms INTEGER NOT NULL,
            cpu_load REAL NOT NULL,
            cpu_temp REAL NOT NULL,
            mem_usage REAL NOT NULL,
            gpu_temp REAL NOT NULL,
            gpu_load REAL NOT NULL,
            fan_speed REAL NOT NULL,
            net_rx REAL NOT NULL,
            net_tx REAL NOT NULL,
            disk_usage REAL NOT NULL,
            disk_read REAL NOT NULL,
            disk_write REAL NOT NULL,
            full_data TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await
    .map_err(fail)?;

    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON metrics(timestamp_ms)",
        "CREATE INDEX IF NOT EXISTS idx_metrics_cpu_load ON metrics(cpu_load)",
        "CREATE INDEX IF NOT EXISTS idx_metrics_mem_usage ON metrics(mem_usage)",
    ] {
        sqlx::query(ddl).execute(&mut *tx).await.map_err(fail)?;
    }

    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(&mut *tx)
        .await
        .map_err(fail)?;
    tx.commit().await.map_err(fail)?;
    Ok(())
}
