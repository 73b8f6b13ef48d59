//! SQLite-backed persistence: discovered traces, scan sessions, and the
//! best-effort cross-run dedup cache.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use deeper_core::AppError;
use deeper_core::dedup::PersistentDedup;
use deeper_core::engine::ExpansionReport;

use crate::config::DatabaseConfig;

/// Local SQLite store. Cloning shares the underlying pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `config.url` and apply
    /// the schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let path = config
            .url
            .strip_prefix("sqlite://")
            .or_else(|| config.url.strip_prefix("sqlite:"))
            .unwrap_or(&config.url);

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self, AppError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), AppError> {
        const SCHEMA: [&str; 3] = [
            r#"
            CREATE TABLE IF NOT EXISTS traces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                value TEXT NOT NULL,
                kind TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                UNIQUE(value, kind)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS scan_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                seed TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                trace_count INTEGER NOT NULL,
                outcome TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT,
                expires_at TEXT
            )
            "#,
        ];

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        }
        Ok(())
    }

    /// Record a finished run: one session row plus every discovered trace
    /// (already-known traces keep their original `first_seen`).
    pub async fn persist_run(&self, report: &ExpansionReport) -> Result<i64, AppError> {
        let finished_at = Utc::now();
        let started_at = finished_at
            - chrono::TimeDelta::from_std(report.duration).unwrap_or(chrono::TimeDelta::zero());

        let session = sqlx::query(
            r#"
            INSERT INTO scan_sessions (seed, started_at, finished_at, trace_count, outcome)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&report.seed.value)
        .bind(started_at.to_rfc3339())
        .bind(finished_at.to_rfc3339())
        .bind(report.traces.len() as i64)
        .bind(format!("{:?}", report.outcome).to_lowercase())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        for trace in &report.traces {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO traces (value, kind, first_seen)
                VALUES (?1, ?2, ?3)
                "#,
            )
            .bind(&trace.value)
            .bind(trace.kind.as_str())
            .bind(finished_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        }

        Ok(session.last_insert_rowid())
    }

    /// Number of distinct traces ever recorded.
    pub async fn trace_count(&self) -> Result<i64, AppError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM traces")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Drop expired cache entries. Returns how many were removed.
    pub async fn prune_expired(&self) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at < ?1")
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(result.rows_affected())
    }
}

impl PersistentDedup for SqliteStore {
    async fn get(&self, key: &str) -> Result<bool, AppError> {
        let row = sqlx::query("SELECT expires_at FROM cache_entries WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let Some(row) = row else { return Ok(false) };
        let expires_at: Option<String> = row.get("expires_at");
        match expires_at {
            None => Ok(true),
            Some(raw) => {
                let expires = DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| AppError::DatabaseError(e.to_string()))?;
                Ok(expires > Utc::now())
            }
        }
    }

    async fn put(&self, key: &str, ttl: Option<Duration>) -> Result<(), AppError> {
        let expires_at = ttl.map(|ttl| {
            (Utc::now() + chrono::TimeDelta::from_std(ttl).unwrap_or(chrono::TimeDelta::zero()))
                .to_rfc3339()
        });

        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at)
            VALUES (?1, '', ?2)
            ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }
}
