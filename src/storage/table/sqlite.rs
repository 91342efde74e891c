//! SQLite table client (`sqlite` feature)
//!
//! Rows live in a two-column table `(key TEXT PRIMARY KEY, value TEXT)` with
//! JSON-encoded values. `LIKE` is switched to case-sensitive matching so key
//! prefixes compare exactly.

use super::{Durability, TableClient, LIKE_ESCAPE};
use crate::core::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

/// Flat table stored in SQLite
#[derive(Debug)]
pub struct SqliteTable {
    url: String,
    table: String,
    pool: Mutex<Option<SqlitePool>>,
}

impl SqliteTable {
    /// Table `table` in the database at `url` (`sqlite:/path/app.db` or `sqlite::memory:`)
    pub fn new(url: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::invalid_input(format!("Invalid table name `{}`", table)));
        }
        Ok(Self {
            url: url.into(),
            table,
            pool: Mutex::new(None),
        })
    }

    fn in_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }

    fn pool(&self) -> Result<SqlitePool> {
        self.pool
            .lock()
            .clone()
            .ok_or_else(|| Error::NotConnected(self.identity()))
    }

    fn fail(&self, e: sqlx::Error) -> Error {
        Error::backend(self.identity(), e.to_string())
    }

    fn decode_row(&self, raw: &str) -> Result<Value> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[async_trait]
impl TableClient for SqliteTable {
    fn identity(&self) -> String {
        format!("{}#{}", self.url, self.table)
    }

    async fn connect(&self, durability: Durability) -> Result<()> {
        if self.pool.lock().is_some() {
            return Ok(());
        }

        let mut options = SqliteConnectOptions::from_str(&self.url)
            .map_err(|e| self.fail(e))?
            .create_if_missing(true)
            .pragma("case_sensitive_like", "ON");
        let synchronous = match durability {
            Durability::Fast => SqliteSynchronous::Off,
            Durability::Balanced => SqliteSynchronous::Normal,
            Durability::Safe => SqliteSynchronous::Full,
        };
        options = options.synchronous(synchronous);
        if !self.in_memory() {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to `:memory:` is a separate database
        let max_connections = if self.in_memory() { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| self.fail(e))?;

        let schema = format!(
            "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL)",
            self.table
        );
        sqlx::query(&schema).execute(&pool).await.map_err(|e| self.fail(e))?;

        info!("SQLite table {} ready ({:?})", self.identity(), durability);
        *self.pool.lock() = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.close().await;
            debug!("Closed {}", self.identity());
        }
        Ok(())
    }

    async fn get_row(&self, key: &str) -> Result<Option<Value>> {
        let pool = self.pool()?;
        let row = sqlx::query(&format!("SELECT value FROM {} WHERE key = ?", self.table))
            .bind(key)
            .fetch_optional(&pool)
            .await
            .map_err(|e| self.fail(e))?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("value").map_err(|e| self.fail(e))?;
                self.decode_row(&raw).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn put_rows(&self, rows: Vec<(String, Value)>) -> Result<()> {
        let pool = self.pool()?;
        let sql = format!(
            "INSERT INTO {} (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            self.table
        );
        let mut tx = pool.begin().await.map_err(|e| self.fail(e))?;
        for (key, value) in rows {
            sqlx::query(&sql)
                .bind(key)
                .bind(serde_json::to_string(&value)?)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.fail(e))?;
        }
        tx.commit().await.map_err(|e| self.fail(e))?;
        Ok(())
    }

    async fn delete_row(&self, key: &str) -> Result<()> {
        let pool = self.pool()?;
        sqlx::query(&format!("DELETE FROM {} WHERE key = ?", self.table))
            .bind(key)
            .execute(&pool)
            .await
            .map_err(|e| self.fail(e))?;
        Ok(())
    }

    async fn rows_like(&self, pattern: &str) -> Result<Vec<(String, Value)>> {
        let pool = self.pool()?;
        let sql = format!(
            "SELECT key, value FROM {} WHERE key LIKE ? ESCAPE '{}'",
            self.table, LIKE_ESCAPE
        );
        let rows = sqlx::query(&sql)
            .bind(pattern)
            .fetch_all(&pool)
            .await
            .map_err(|e| self.fail(e))?;
        rows.into_iter()
            .map(|row| {
                let key: String = row.try_get("key").map_err(|e| self.fail(e))?;
                let raw: String = row.try_get("value").map_err(|e| self.fail(e))?;
                Ok((key, self.decode_row(&raw)?))
            })
            .collect()
    }

    async fn delete_like(&self, pattern: &str) -> Result<()> {
        let pool = self.pool()?;
        let sql = format!("DELETE FROM {} WHERE key LIKE ? ESCAPE '{}'", self.table, LIKE_ESCAPE);
        sqlx::query(&sql)
            .bind(pattern)
            .execute(&pool)
            .await
            .map_err(|e| self.fail(e))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let pool = self.pool()?;
        sqlx::query(&format!("DELETE FROM {}", self.table))
            .execute(&pool)
            .await
            .map_err(|e| self.fail(e))?;
        Ok(())
    }
}
