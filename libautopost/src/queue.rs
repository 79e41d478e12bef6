//! Publish queue
//!
//! Entries leave `queued` exactly once. Every status change is a conditional
//! `UPDATE ... WHERE status = 'queued'`, so of two racing writers only one
//! ever observes `rows_affected() == 1`; the schema trigger backs this up for
//! writers that bypass this module.

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{AutopostError, DbError, Result};
use crate::ledger;
use crate::types::{NewQueueEntry, Outcome, PostLogRecord, QueueEntry, QueueStatus, DEFAULT_PRIORITY};

const ENTRY_COLUMNS: &str =
    "id, niche, raw_item_id, text, media_ref, priority, status, scheduled_at, claimed_at, created_at, posted_at";

/// Error recorded for entries whose dispatcher died between publishing and recording
pub const INTERRUPTED_ERROR: &str = "interrupted before outcome was recorded";

/// Priority for an item's content type; lower is more urgent
pub fn priority_for_content_type(content_type: &str) -> i64 {
    match content_type {
        "top1_verified" | "breaking_news" | "robtop_tweet" => 1,
        "official_tweet" | "patch_notes" | "game_update" | "season_start" | "event_announcement" => 2,
        "esports_result" | "roster_change" | "demon_list_update" | "level_verified" | "collab_announcement" => 3,
        "item_shop" | "daily_level" | "weekly_demon" | "mod_update" | "level_rated" | "esports_matchup" => 4,
        "level_beaten" | "youtube_video" | "pro_player_content" | "creator_spotlight" | "speedrun_wr" => 5,
        "reddit_highlight" | "community_clip" => 7,
        "rank_milestone" => 8,
        _ => DEFAULT_PRIORITY,
    }
}

/// Per-niche counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub niche: String,
    pub queued: i64,
    pub posted: i64,
    pub failed: i64,
    pub skipped: i64,
    pub oldest_queued: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub struct PublishQueue {
    stale_after: i64,
}

impl PublishQueue {
    /// `stale_after` is the maximum age in seconds of a queued entry
    pub fn new(stale_after: u64) -> Self {
        Self {
            stale_after: stale_after as i64,
        }
    }

    pub fn stale_after(&self) -> i64 {
        self.stale_after
    }

    pub async fn enqueue(&self, db: &Database, entry: &NewQueueEntry) -> Result<i64> {
        if entry.priority < 1 {
            return Err(AutopostError::InvalidInput(format!(
                "priority must be >= 1, got {}",
                entry.priority
            )));
        }
        if entry.text.trim().is_empty() {
            return Err(AutopostError::InvalidInput("queue entry text is empty".to_string()));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO queue_entries
                (niche, raw_item_id, text, media_ref, priority, status, scheduled_at, created_at)
            VALUES (?, ?, ?, ?, ?, 'queued', ?, ?)
            "#,
        )
        .bind(&entry.niche)
        .bind(entry.raw_item_id)
        .bind(&entry.text)
        .bind(&entry.media_ref)
        .bind(entry.priority)
        .bind(entry.scheduled_at)
        .bind(entry.created_at)
        .execute(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let id = result.last_insert_rowid();
        debug!(entry_id = id, niche = %entry.niche, priority = entry.priority, "entry queued");
        Ok(id)
    }

    /// Skip unclaimed queued entries older than the staleness limit.
    ///
    /// `None` sweeps every niche. Returns the number of entries skipped.
    pub async fn skip_stale(&self, db: &Database, niche: Option<&str>, now: i64) -> Result<u64> {
        let cutoff = now - self.stale_after;
        let result = sqlx::query(
            r#"
            UPDATE queue_entries SET status = 'skipped'
            WHERE status = 'queued' AND claimed_at IS NULL
              AND created_at < ?
              AND (? IS NULL OR niche = ?)
            "#,
        )
        .bind(cutoff)
        .bind(niche)
        .bind(niche)
        .execute(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let skipped = result.rows_affected();
        if skipped > 0 {
            info!(niche = niche.unwrap_or("*"), skipped, "skipped stale queue entries");
        }
        Ok(skipped)
    }

    /// Next entry to publish for a niche.
    ///
    /// Stale entries are skipped first. Among what is left: queued, not
    /// claimed, not scheduled in the future, ordered by priority then age.
    pub async fn next_eligible(&self, db: &Database, niche: &str, now: i64) -> Result<Option<QueueEntry>> {
        self.skip_stale(db, Some(niche), now).await?;

        let row = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM queue_entries
            WHERE niche = ? AND status = 'queued' AND claimed_at IS NULL
              AND (scheduled_at IS NULL OR scheduled_at <= ?)
            ORDER BY priority ASC, created_at ASC, id ASC
            LIMIT 1
            "#
        ))
        .bind(niche)
        .bind(now)
        .fetch_optional(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| row_to_entry(&r)).transpose()
    }

    /// Take exclusive hold of a queued entry before publishing it.
    ///
    /// Returns false if another dispatcher already holds it or it is no
    /// longer queued.
    pub async fn claim(&self, db: &Database, entry_id: i64, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE queue_entries SET claimed_at = ? WHERE id = ? AND status = 'queued' AND claimed_at IS NULL",
        )
        .bind(now)
        .bind(entry_id)
        .execute(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Move a queued entry to its final status.
    ///
    /// `Posted` and `Failed` append a ledger record in the same transaction
    /// and return it; `Skipped` writes no ledger row. Marking an entry that
    /// already left `queued` is `InvalidTransition`.
    pub async fn mark(&self, db: &Database, entry_id: i64, outcome: &Outcome, now: i64) -> Result<Option<PostLogRecord>> {
        let status = outcome.status();
        let posted_at = matches!(outcome, Outcome::Posted { .. }).then_some(now);

        let mut tx = db.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE queue_entries SET status = ?, posted_at = ?, claimed_at = NULL
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(status.as_str())
        .bind(posted_at)
        .bind(entry_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let row = sqlx::query("SELECT niche, text, status FROM queue_entries WHERE id = ?")
            .bind(entry_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        let Some(row) = row else {
            return Err(AutopostError::InvalidInput(format!("Unknown queue entry: {}", entry_id)));
        };

        if updated.rows_affected() == 0 {
            return Err(AutopostError::InvalidTransition {
                entry_id,
                status: row.get("status"),
            });
        }

        let niche: String = row.get("niche");
        let text: String = row.get("text");

        let record = match outcome {
            Outcome::Posted { external_post_id } => Some(PostLogRecord {
                id: None,
                queue_entry_id: entry_id,
                niche,
                external_post_id: Some(external_post_id.clone()),
                text,
                posted_at: now,
                error: None,
            }),
            Outcome::Failed { error } => Some(PostLogRecord {
                id: None,
                queue_entry_id: entry_id,
                niche,
                external_post_id: None,
                text,
                posted_at: now,
                error: Some(error.clone()),
            }),
            Outcome::Skipped => None,
        };

        let record = match record {
            Some(record) => Some(ledger::append(&mut *tx, &record).await?),
            None => None,
        };

        tx.commit().await.map_err(DbError::SqlxError)?;
        debug!(entry_id, status = %status, "entry marked");
        Ok(record)
    }

    /// Fail entries claimed longer than `lease` seconds ago.
    ///
    /// A claim only outlives its dispatcher if the process died mid-publish.
    /// The post may or may not have gone out, so the entry is never offered
    /// again.
    pub async fn recover_abandoned(&self, db: &Database, lease: u64, now: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT id FROM queue_entries WHERE status = 'queued' AND claimed_at IS NOT NULL AND claimed_at <= ?",
        )
        .bind(now - lease as i64)
        .fetch_all(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let mut recovered = Vec::new();
        for row in rows {
            let entry_id: i64 = row.get("id");
            let outcome = Outcome::Failed {
                error: INTERRUPTED_ERROR.to_string(),
            };
            match self.mark(db, entry_id, &outcome, now).await {
                Ok(_) => {
                    warn!(entry_id, "abandoned claim recovered as failed");
                    recovered.push(entry_id);
                }
                // finished by its owner in the meantime
                Err(AutopostError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    pub async fn get(&self, db: &Database, entry_id: i64) -> Result<Option<QueueEntry>> {
        let row = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = ?"))
            .bind(entry_id)
            .fetch_optional(db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        row.map(|r| row_to_entry(&r)).transpose()
    }

    /// Entries in selection order, optionally filtered
    pub async fn list(
        &self,
        db: &Database,
        niche: Option<&str>,
        status: Option<QueueStatus>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>> {
        let status = status.map(|s| s.as_str());
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM queue_entries
            WHERE (? IS NULL OR niche = ?) AND (? IS NULL OR status = ?)
            ORDER BY priority ASC, created_at ASC, id ASC
            LIMIT ?
            "#
        ))
        .bind(niche)
        .bind(niche)
        .bind(status)
        .bind(status)
        .bind(limit as i64)
        .fetch_all(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_entry).collect()
    }

    /// Status counts for each niche that has entries
    pub async fn stats(&self, db: &Database, niche: Option<&str>) -> Result<Vec<QueueStats>> {
        let rows = sqlx::query(
            r#"
            SELECT niche,
                   SUM(CASE WHEN status = 'queued' THEN 1 ELSE 0 END) AS queued,
                   SUM(CASE WHEN status = 'posted' THEN 1 ELSE 0 END) AS posted,
                   SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed,
                   SUM(CASE WHEN status = 'skipped' THEN 1 ELSE 0 END) AS skipped,
                   MIN(CASE WHEN status = 'queued' THEN created_at END) AS oldest_queued
            FROM queue_entries
            WHERE (? IS NULL OR niche = ?)
            GROUP BY niche
            ORDER BY niche ASC
            "#,
        )
        .bind(niche)
        .bind(niche)
        .fetch_all(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| QueueStats {
                niche: r.get("niche"),
                queued: r.get("queued"),
                posted: r.get("posted"),
                failed: r.get("failed"),
                skipped: r.get("skipped"),
                oldest_queued: r.get("oldest_queued"),
            })
            .collect())
    }
}

impl Default for PublishQueue {
    fn default() -> Self {
        Self::new(6 * 60 * 60)
    }
}

fn row_to_entry(r: &SqliteRow) -> Result<QueueEntry> {
    let status: String = r.get("status");
    let status = status.parse::<QueueStatus>().map_err(|reason| DbError::Decode {
        table: "queue_entries",
        reason,
    })?;

    Ok(QueueEntry {
        id: r.get("id"),
        niche: r.get("niche"),
        raw_item_id: r.get("raw_item_id"),
        text: r.get("text"),
        media_ref: r.get("media_ref"),
        priority: r.get("priority"),
        status,
        scheduled_at: r.get("scheduled_at"),
        claimed_at: r.get("claimed_at"),
        created_at: r.get("created_at"),
        posted_at: r.get("posted_at"),
    })
}
