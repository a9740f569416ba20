use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::error::{ClockError, DeliveryError};
use crate::reading::{format_stored, parse_stored, Reading};
use crate::sink::Sink;

/// Local SQLite store.  One row per reading, keyed by a unique timestamp.
#[derive(Clone)]
pub struct LocalStore {
    pool: Pool<Sqlite>,
}

impl LocalStore {
    /// db_url examples:
    /// - "sqlite:/home/pi/enviro/enviro.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        Self::connect(&format!("sqlite:{}", path.display())).await
    }

    /// Create the `enviro` table if it is missing.  Idempotent.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        tracing::info!("local db schema ready");
        Ok(())
    }

    /// Insert a reading.  Returns `false` when a row with the same timestamp
    /// already exists; that is not an error.
    pub async fn insert(&self, r: &Reading) -> Result<bool, DeliveryError> {
        let ts = format_stored(r.timestamp)?;
        let result = sqlx::query(
            r#"
            INSERT INTO enviro (
              timestamp,
              temperature, pressure, humidity,
              oxidised, reduced, nh3,
              lux
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(ts.as_str())
        .bind(r.temperature)
        .bind(r.pressure)
        .bind(r.humidity)
        .bind(r.oxidised)
        .bind(r.reduced)
        .bind(r.nh3)
        .bind(r.lux)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            tracing::debug!(timestamp = %ts, "inserted into local db");
        } else {
            tracing::debug!(timestamp = %ts, "duplicate timestamp, local insert skipped");
        }
        Ok(inserted)
    }

    /// Most recent stored timestamp, `None` for an empty table.
    ///
    /// Rows may carry different UTC offsets, so ordering is by instant
    /// (`julianday` folds the offset in), not by text.
    pub async fn last_timestamp(&self) -> Result<Option<OffsetDateTime>, ClockError> {
        let row = sqlx::query(
            r#"
            SELECT timestamp
            FROM enviro
            ORDER BY julianday(timestamp) DESC, timestamp DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.try_get("timestamp")?;
        parse_stored(&raw)
            .map(Some)
            .ok_or(ClockError::Unparseable(raw))
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM enviro")
            .fetch_one(&self.pool)
            .await
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl Sink for LocalStore {
    fn name(&self) -> &'static str {
        "local db"
    }

    async fn deliver(&mut self, reading: &Reading) -> Result<(), DeliveryError> {
        self.insert(reading).await.map(|_| ())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
