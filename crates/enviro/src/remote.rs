//! Remote PostgreSQL store.  A fresh connection per insert; nothing is
//! pooled or retried.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use tokio::time::timeout;

use crate::config::DbConfig;
use crate::error::DeliveryError;
use crate::reading::Reading;
use crate::sink::Sink;

pub struct RemoteStore {
    options: PgConnectOptions,
    insert_sql: String,
    timeout: Duration,
}

/// Build the INSERT for `table`.  The name must already have passed
/// `config::is_sql_identifier`.
fn insert_sql(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {table} (
          timestamp,
          temperature, pressure, humidity,
          oxidised, reduced, nh3,
          lux
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT DO NOTHING
        "#
    )
}

impl RemoteStore {
    /// `None` when no remote host is configured.
    pub fn from_config(cfg: &DbConfig) -> Option<Self> {
        let host = cfg.host.as_deref()?;
        let options = PgConnectOptions::new()
            .host(host)
            .port(cfg.port)
            .username(&cfg.user)
            .password(&cfg.password)
            .database(&cfg.db)
            .application_name("enviro");

        tracing::info!(host, port = cfg.port, db = %cfg.db, table = %cfg.table, "remote db configured");

        Some(Self {
            options,
            insert_sql: insert_sql(&cfg.table),
            timeout: Duration::from_secs(cfg.timeout),
        })
    }

    /// Insert a reading over a one-off connection.  Returns `false` when the
    /// timestamp was already present.
    pub async fn insert(&self, r: &Reading) -> Result<bool, DeliveryError> {
        let secs = self.timeout.as_secs();

        let mut conn = timeout(self.timeout, PgConnection::connect_with(&self.options))
            .await
            .map_err(|_| DeliveryError::Timeout("remote db connect", secs))??;
        tracing::debug!("connected to remote db");

        let result = timeout(
            self.timeout,
            sqlx::query(&self.insert_sql)
                .bind(r.timestamp)
                .bind(r.temperature)
                .bind(r.pressure)
                .bind(r.humidity)
                .bind(r.oxidised)
                .bind(r.reduced)
                .bind(r.nh3)
                .bind(r.lux)
                .execute(&mut conn),
        )
        .await;

        // Close before looking at the result so a failed insert does not
        // leave the session open on the server.
        match timeout(self.timeout, conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("remote db close failed: {e}"),
            Err(_) => tracing::debug!("remote db close timed out"),
        }

        let done = result.map_err(|_| DeliveryError::Timeout("remote db insert", secs))??;
        let inserted = done.rows_affected() > 0;
        tracing::debug!(inserted, "remote insert complete");
        Ok(inserted)
    }
}

#[async_trait]
impl Sink for RemoteStore {
    fn name(&self) -> &'static str {
        "remote db"
    }

    async fn deliver(&mut self, reading: &Reading) -> Result<(), DeliveryError> {
        self.insert(reading).await.map(|_| ())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
