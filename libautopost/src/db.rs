//! Database connection and source records
//!
//! The four durable entities (sources, raw items, queue entries, post log)
//! share one SQLite file. Component-specific queries live next to the
//! component that owns them; this module owns the pool and the `sources` table.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DbError, Result};
use crate::types::{NewSource, Source, SourceConfig};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        debug!(path = %expanded_path, "database ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction; dropping it without commit rolls back
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await.map_err(DbError::SqlxError)?)
    }

    /// Insert a source unless `(niche, name)` already exists; return its id.
    ///
    /// An existing source keeps its enabled flag: seeding never re-enables a
    /// source the health tracker or an operator disabled.
    pub async fn upsert_source(&self, source: &NewSource, now: i64) -> Result<i64> {
        let config_json = serde_json::to_string(&source.config).map_err(|e| DbError::Decode {
            table: "sources",
            reason: e.to_string(),
        })?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO sources (niche, name, kind, config, poll_interval, enabled, created_at)
            VALUES (?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(niche, name) DO NOTHING
            "#,
        )
        .bind(&source.niche)
        .bind(&source.name)
        .bind(source.config.kind())
        .bind(&config_json)
        .bind(source.poll_interval.map(|p| p as i64))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let row = sqlx::query("SELECT id FROM sources WHERE niche = ? AND name = ?")
            .bind(&source.niche)
            .bind(&source.name)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        let id: i64 = row.get("id");

        if inserted.rows_affected() == 1 {
            info!(source_id = id, niche = %source.niche, name = %source.name, "seeded source");
        }
        Ok(id)
    }

    /// Seed every configured source, returning their ids in order
    pub async fn seed_sources(&self, sources: &[NewSource], now: i64) -> Result<Vec<i64>> {
        let mut ids = Vec::with_capacity(sources.len());
        for source in sources {
            ids.push(self.upsert_source(source, now).await?);
        }
        Ok(ids)
    }

    pub async fn get_source(&self, source_id: i64) -> Result<Option<Source>> {
        let row = sqlx::query(
            r#"
            SELECT id, niche, name, config, poll_interval, enabled, disabled_at, health_reset_at, created_at
            FROM sources WHERE id = ?
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| row_to_source(&r)).transpose()
    }

    /// List sources, optionally restricted to a niche and to enabled ones
    pub async fn list_sources(&self, niche: Option<&str>, enabled_only: bool) -> Result<Vec<Source>> {
        let rows = sqlx::query(
            r#"
            SELECT id, niche, name, config, poll_interval, enabled, disabled_at, health_reset_at, created_at
            FROM sources
            WHERE (? IS NULL OR niche = ?)
              AND (? = 0 OR enabled = 1)
            ORDER BY niche ASC, id ASC
            "#,
        )
        .bind(niche)
        .bind(niche)
        .bind(enabled_only as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_source).collect()
    }
}

fn row_to_source(r: &SqliteRow) -> Result<Source> {
    let config_json: String = r.get("config");
    let config: SourceConfig = serde_json::from_str(&config_json).map_err(|e| DbError::Decode {
        table: "sources",
        reason: e.to_string(),
    })?;

    Ok(Source {
        id: r.get("id"),
        niche: r.get("niche"),
        name: r.get("name"),
        config,
        poll_interval: r.get::<Option<i64>, _>("poll_interval").map(|p| p.max(0) as u64),
        enabled: r.get::<i64, _>("enabled") != 0,
        disabled_at: r.get("disabled_at"),
        health_reset_at: r.get("health_reset_at"),
        created_at: r.get("created_at"),
    })
}

/// Open a throwaway database in a temp dir
#[cfg(test)]
pub(crate) async fn test_db() -> (tempfile::TempDir, Database) {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
    (temp_dir, db)
}

/// Seed a source for tests and return its id
#[cfg(test)]
pub(crate) async fn test_source(db: &Database, niche: &str, name: &str) -> i64 {
    db.upsert_source(
        &NewSource {
            niche: niche.to_string(),
            name: name.to_string(),
            config: SourceConfig::Rss {
                url: format!("https://example.com/{}", name),
            },
            poll_interval: None,
        },
        0,
    )
    .await
    .unwrap()
}
