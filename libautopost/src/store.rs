//! Content store: the deduplicated record of every discovered item

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::db::Database;
use crate::error::{DbError, Result};
use crate::types::{IngestOutcome, NewRawItem, RawItem};

impl Database {
    /// Store an item unless its `(source_id, external_id)` is already known.
    ///
    /// Repeated or concurrent ingestion of the same key is not an error: the
    /// losers get `Duplicate` carrying the id of the row that won.
    pub async fn ingest(&self, item: &NewRawItem) -> Result<IngestOutcome> {
        let metadata = serde_json::to_string(&item.metadata).map_err(|e| DbError::Decode {
            table: "raw_items",
            reason: e.to_string(),
        })?;

        let mut tx = self.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO raw_items
                (source_id, external_id, niche, content_type, title, body, url,
                 image_url, author, score, metadata, collected_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id, external_id) DO NOTHING
            "#,
        )
        .bind(item.source_id)
        .bind(&item.external_id)
        .bind(&item.niche)
        .bind(&item.content_type)
        .bind(&item.title)
        .bind(&item.body)
        .bind(&item.url)
        .bind(&item.image_url)
        .bind(&item.author)
        .bind(item.score)
        .bind(&metadata)
        .bind(item.collected_at)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let outcome = if result.rows_affected() == 1 {
            IngestOutcome::Inserted(result.last_insert_rowid())
        } else {
            let row = sqlx::query("SELECT id FROM raw_items WHERE source_id = ? AND external_id = ?")
                .bind(item.source_id)
                .bind(&item.external_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(DbError::SqlxError)?;
            IngestOutcome::Duplicate(row.get("id"))
        };

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(outcome)
    }

    pub async fn get_raw_item(&self, id: i64) -> Result<Option<RawItem>> {
        let row = sqlx::query(
            r#"
            SELECT id, source_id, external_id, niche, content_type, title, body, url,
                   image_url, author, score, metadata, collected_at
            FROM raw_items WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| row_to_raw_item(&r)).transpose()
    }

    /// Number of stored items for a source
    pub async fn count_raw_items(&self, source_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM raw_items WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(self.pool())
            .await
            .map_err(DbError::SqlxError)?;
        Ok(row.get("cnt"))
    }
}

fn row_to_raw_item(r: &SqliteRow) -> Result<RawItem> {
    let metadata: String = r.get("metadata");
    let metadata = serde_json::from_str(&metadata).map_err(|e| DbError::Decode {
        table: "raw_items",
        reason: e.to_string(),
    })?;

    Ok(RawItem {
        id: r.get("id"),
        source_id: r.get("source_id"),
        external_id: r.get("external_id"),
        niche: r.get("niche"),
        content_type: r.get("content_type"),
        title: r.get("title"),
        body: r.get("body"),
        url: r.get("url"),
        image_url: r.get("image_url"),
        author: r.get("author"),
        score: r.get("score"),
        metadata,
        collected_at: r.get("collected_at"),
    })
}
