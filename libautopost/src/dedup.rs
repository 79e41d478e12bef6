//! Enqueue-time duplicate suppression
//!
//! The content store only deduplicates on `(source_id, external_id)`. The
//! same story often arrives through several sources, so before queueing a
//! newly stored item we also check for an entry backed by the same URL and
//! for a still-queued entry with nearly the same text.

use sqlx::Row;
use tracing::debug;

use crate::config::DedupConfig;
use crate::db::Database;
use crate::error::{DbError, Result};
use crate::types::RawItem;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DedupVerdict {
    Unique,
    /// Another raw item with the same URL already produced a queue entry
    SameUrl { entry_id: i64 },
    /// A queued entry with similar text exists
    SimilarText { entry_id: i64, similarity: f64 },
}

impl DedupVerdict {
    pub fn is_unique(&self) -> bool {
        matches!(self, DedupVerdict::Unique)
    }
}

#[derive(Debug, Clone)]
pub struct Deduplicator {
    similarity_threshold: f64,
    similarity_window: i64,
    cross_source_url: bool,
}

impl Deduplicator {
    pub fn new(similarity_threshold: f64, similarity_hours: u64, cross_source_url: bool) -> Self {
        Self {
            similarity_threshold,
            similarity_window: similarity_hours as i64 * 3600,
            cross_source_url,
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(
            config.similarity_threshold,
            config.similarity_hours,
            config.cross_source_url,
        )
    }

    /// Decide whether a freshly stored item's formatted text may be queued
    pub async fn check(&self, db: &Database, item: &RawItem, text: &str, now: i64) -> Result<DedupVerdict> {
        if self.cross_source_url {
            if let Some(entry_id) = self.url_already_queued(db, item).await? {
                debug!(raw_item_id = item.id, entry_id, url = %item.url, "duplicate url");
                return Ok(DedupVerdict::SameUrl { entry_id });
            }
        }

        if let Some((entry_id, similarity)) = self.similar_story_queued(db, &item.niche, text, now).await? {
            debug!(raw_item_id = item.id, entry_id, similarity, "near-duplicate story");
            return Ok(DedupVerdict::SimilarText { entry_id, similarity });
        }

        Ok(DedupVerdict::Unique)
    }

    /// Queue entry (any status) created from a different raw item with the same URL
    pub async fn url_already_queued(&self, db: &Database, item: &RawItem) -> Result<Option<i64>> {
        if item.url.trim().is_empty() {
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            SELECT q.id FROM queue_entries q
            JOIN raw_items r ON r.id = q.raw_item_id
            WHERE r.url = ? AND r.niche = ? AND r.id <> ?
            ORDER BY q.id ASC
            LIMIT 1
            "#,
        )
        .bind(&item.url)
        .bind(&item.niche)
        .bind(item.id)
        .fetch_optional(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| r.get("id")))
    }

    /// Most similar recent queued entry at or above the threshold
    pub async fn similar_story_queued(
        &self,
        db: &Database,
        niche: &str,
        text: &str,
        now: i64,
    ) -> Result<Option<(i64, f64)>> {
        let rows = sqlx::query(
            r#"
            SELECT id, text FROM queue_entries
            WHERE niche = ? AND status = 'queued' AND created_at >= ?
            "#,
        )
        .bind(niche)
        .bind(now - self.similarity_window)
        .fetch_all(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let candidate = normalize(text);
        let best = rows
            .iter()
            .map(|r| {
                let other: String = r.get("text");
                (r.get::<i64, _>("id"), similarity(&candidate, &normalize(&other)))
            })
            .filter(|(_, score)| *score >= self.similarity_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1));

        Ok(best)
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::from_config(&DedupConfig::default())
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
}
