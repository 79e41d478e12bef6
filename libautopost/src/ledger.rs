//! Post ledger: one immutable row per dispatch attempt
//!
//! The rate limiter reads its state from here, so spacing and quota always
//! agree with what was actually published, including across restarts.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::db::Database;
use crate::error::{DbError, Result};
use crate::types::PostLogRecord;

/// Append a record inside the caller's transaction and return it with its id
pub(crate) async fn append(conn: &mut SqliteConnection, record: &PostLogRecord) -> Result<PostLogRecord> {
    let result = sqlx::query(
        r#"
        INSERT INTO post_log (queue_entry_id, niche, external_post_id, text, posted_at, error)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.queue_entry_id)
    .bind(&record.niche)
    .bind(&record.external_post_id)
    .bind(&record.text)
    .bind(record.posted_at)
    .bind(&record.error)
    .execute(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    Ok(PostLogRecord {
        id: Some(result.last_insert_rowid()),
        ..record.clone()
    })
}

impl Database {
    /// Time of the most recent successful post for a niche
    pub async fn last_successful_post(&self, niche: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"
            SELECT MAX(posted_at) AS last FROM post_log
            WHERE niche = ? AND external_post_id IS NOT NULL
            "#,
        )
        .bind(niche)
        .fetch_one(self.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.get("last"))
    }

    /// Successful posts for a niche with `start <= posted_at < end`
    pub async fn successful_posts_between(&self, niche: &str, start: i64, end: i64) -> Result<u32> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS cnt FROM post_log
            WHERE niche = ? AND external_post_id IS NOT NULL
              AND posted_at >= ? AND posted_at < ?
            "#,
        )
        .bind(niche)
        .bind(start)
        .bind(end)
        .fetch_one(self.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.get::<i64, _>("cnt") as u32)
    }

    /// Recent attempts, newest first, optionally for one niche
    pub async fn post_history(&self, niche: Option<&str>, limit: usize) -> Result<Vec<PostLogRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, queue_entry_id, niche, external_post_id, text, posted_at, error
            FROM post_log
            WHERE (? IS NULL OR niche = ?)
            ORDER BY posted_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(niche)
        .bind(niche)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(row_to_record).collect())
    }

    /// Every attempt recorded for one queue entry
    pub async fn attempts_for_entry(&self, queue_entry_id: i64) -> Result<Vec<PostLogRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, queue_entry_id, niche, external_post_id, text, posted_at, error
            FROM post_log WHERE queue_entry_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(queue_entry_id)
        .fetch_all(self.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(row_to_record).collect())
    }
}

fn row_to_record(r: &SqliteRow) -> PostLogRecord {
    PostLogRecord {
        id: r.get("id"),
        queue_entry_id: r.get("queue_entry_id"),
        niche: r.get("niche"),
        external_post_id: r.get("external_post_id"),
        text: r.get("text"),
        posted_at: r.get("posted_at"),
        error: r.get("error"),
    }
}

/// Write ledger rows directly, bypassing the dispatcher.
///
/// Quota tests need hundreds of historical posts; this keeps them fast.
#[cfg(test)]
pub(crate) async fn seed_successes(db: &Database, niche: &str, times: &[i64]) {
    let mut tx = db.begin().await.unwrap();
    for (i, at) in times.iter().enumerate() {
        let entry = sqlx::query(
            "INSERT INTO queue_entries (niche, text, priority, status, created_at, posted_at) VALUES (?, ?, 5, 'posted', ?, ?)",
        )
        .bind(niche)
        .bind(format!("seeded {}", i))
        .bind(at)
        .bind(at)
        .execute(&mut *tx)
        .await
        .unwrap();

        append(
            &mut *tx,
            &PostLogRecord {
                id: None,
                queue_entry_id: entry.last_insert_rowid(),
                niche: niche.to_string(),
                external_post_id: Some(format!("seed-{}", i)),
                text: format!("seeded {}", i),
                posted_at: *at,
                error: None,
            },
        )
        .await
        .unwrap();
    }
    tx.commit().await.unwrap();
}
