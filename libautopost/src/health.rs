//! Source health tracking
//!
//! Collectors report failures as timestamped events. When the number of
//! events inside the trailing window reaches the threshold the source is
//! disabled, and it stays disabled until an operator re-enables it.
//! Events are never deleted; the window is a query, evaluated when an error
//! is recorded.

use sqlx::{Row, SqliteConnection};
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::db::Database;
use crate::error::{AutopostError, DbError, Result};
use crate::types::SourceErrorEvent;

/// What recording an error (or re-evaluating the window) did to a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    /// Still enabled
    Healthy { recent_errors: u32 },
    /// This evaluation disabled the source
    Disabled { recent_errors: u32 },
    /// The source was already disabled; nothing changed
    AlreadyDisabled,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthTracker {
    window: i64,
    threshold: u32,
}

impl HealthTracker {
    pub fn new(window_secs: u64, threshold: u32) -> Self {
        Self {
            window: window_secs as i64,
            threshold: threshold.max(1),
        }
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(config.window, config.threshold)
    }

    /// Record a failure and disable the source if it crossed the threshold
    pub async fn record_error(
        &self,
        db: &Database,
        source_id: i64,
        at: i64,
        detail: &str,
    ) -> Result<HealthTransition> {
        let mut tx = db.begin().await?;

        sqlx::query("INSERT INTO source_errors (source_id, occurred_at, detail) VALUES (?, ?, ?)")
            .bind(source_id)
            .bind(at)
            .bind(detail)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        let transition = self.evaluate(&mut *tx, source_id, at).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;

        match transition {
            HealthTransition::Disabled { recent_errors } => warn!(
                source_id,
                recent_errors,
                threshold = self.threshold,
                "source disabled after repeated failures"
            ),
            HealthTransition::Healthy { recent_errors } => {
                debug!(source_id, recent_errors, detail, "source error recorded")
            }
            HealthTransition::AlreadyDisabled => {
                debug!(source_id, detail, "error recorded for disabled source")
            }
        }

        Ok(transition)
    }

    /// Re-evaluate the window at `now` without recording a new error
    pub async fn reconsider(&self, db: &Database, source_id: i64, now: i64) -> Result<HealthTransition> {
        let mut tx = db.begin().await?;
        let transition = self.evaluate(&mut *tx, source_id, now).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(transition)
    }

    pub async fn is_enabled(&self, db: &Database, source_id: i64) -> Result<bool> {
        let row = sqlx::query("SELECT enabled FROM sources WHERE id = ?")
            .bind(source_id)
            .fetch_optional(db.pool())
            .await
            .map_err(DbError::SqlxError)?
            .ok_or_else(|| AutopostError::InvalidInput(format!("Source not found: {}", source_id)))?;
        Ok(row.get::<i64, _>("enabled") != 0)
    }

    /// Operator action: enable a source and start its health window afresh.
    ///
    /// Returns false if the source was already enabled.
    pub async fn enable(&self, db: &Database, source_id: i64, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sources SET enabled = 1, disabled_at = NULL, health_reset_at = ?
            WHERE id = ? AND enabled = 0
            "#,
        )
        .bind(now)
        .bind(source_id)
        .execute(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            // distinguish "already enabled" from "no such source"
            self.is_enabled(db, source_id).await?;
            return Ok(false);
        }

        info!(source_id, "source re-enabled by operator");
        Ok(true)
    }

    /// Errors that currently count toward the threshold
    pub async fn recent_errors(&self, db: &Database, source_id: i64, now: i64) -> Result<u32> {
        let mut conn = db.pool().acquire().await.map_err(DbError::SqlxError)?;
        count_in_window(&mut *conn, source_id, now, self.window).await
    }

    /// Full error history for a source, newest first
    pub async fn error_history(&self, db: &Database, source_id: i64, limit: usize) -> Result<Vec<SourceErrorEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_id, occurred_at, detail FROM source_errors
            WHERE source_id = ?
            ORDER BY occurred_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(source_id)
        .bind(limit as i64)
        .fetch_all(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| SourceErrorEvent {
                id: r.get("id"),
                source_id: r.get("source_id"),
                occurred_at: r.get("occurred_at"),
                detail: r.get("detail"),
            })
            .collect())
    }

    async fn evaluate(&self, conn: &mut SqliteConnection, source_id: i64, now: i64) -> Result<HealthTransition> {
        let row = sqlx::query("SELECT enabled FROM sources WHERE id = ?")
            .bind(source_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(DbError::SqlxError)?
            .ok_or_else(|| AutopostError::InvalidInput(format!("Source not found: {}", source_id)))?;

        if row.get::<i64, _>("enabled") == 0 {
            return Ok(HealthTransition::AlreadyDisabled);
        }

        let recent_errors = count_in_window(conn, source_id, now, self.window).await?;
        if recent_errors < self.threshold {
            return Ok(HealthTransition::Healthy { recent_errors });
        }

        let result = sqlx::query("UPDATE sources SET enabled = 0, disabled_at = ? WHERE id = ? AND enabled = 1")
            .bind(now)
            .bind(source_id)
            .execute(&mut *conn)
            .await
            .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 1 {
            Ok(HealthTransition::Disabled { recent_errors })
        } else {
            Ok(HealthTransition::AlreadyDisabled)
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::from_config(&HealthConfig::default())
    }
}

/// Events in `(now - window, now]` that happened after the last operator reset
async fn count_in_window(conn: &mut SqliteConnection, source_id: i64, now: i64, window: i64) -> Result<u32> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS cnt
        FROM source_errors e
        JOIN sources s ON s.id = e.source_id
        WHERE e.source_id = ?
          AND e.occurred_at > ?
          AND e.occurred_at <= ?
          AND e.occurred_at >= COALESCE(s.health_reset_at, e.occurred_at)
        "#,
    )
    .bind(source_id)
    .bind(now - window)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    Ok(row.get::<i64, _>("cnt") as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_db, test_source};

    const BASE: i64 = 1_700_000_000;

    #[tokio::test]
    async fn test_disables_at_threshold_exactly_once() {
        let (_temp, db) = test_db().await;
        let source_id = test_source(&db, "rl", "flaky").await;
        let tracker = HealthTracker::new(3600, 10);

        let mut disabled_transitions = 0;
        for i in 0..15 {
            let transition = tracker
                .record_error(&db, source_id, BASE + i * 60, "HTTP 503")
                .await
                .unwrap();
            match transition {
                HealthTransition::Disabled { recent_errors } => {
                    assert_eq!(i, 9, "should disable on the tenth error");
                    assert_eq!(recent_errors, 10);
                    disabled_transitions += 1;
                }
                HealthTransition::Healthy { recent_errors } => {
                    assert!(i < 9);
                    assert_eq!(recent_errors as i64, i + 1);
                }
                HealthTransition::AlreadyDisabled => assert!(i > 9),
            }
        }

        assert_eq!(disabled_transitions, 1);
        assert!(!tracker.is_enabled(&db, source_id).await.unwrap());
        let source = db.get_source(source_id).await.unwrap().unwrap();
        assert_eq!(source.disabled_at, Some(BASE + 9 * 60));
    }

    #[tokio::test]
    async fn test_errors_spread_beyond_window_do_not_disable() {
        let (_temp, db) = test_db().await;
        let source_id = test_source(&db, "rl", "slow-flaky").await;
        let tracker = HealthTracker::new(3600, 10);

        // one error every 7 minutes: never more than 9 inside an hour
        for i in 0..30 {
            let transition = tracker
                .record_error(&db, source_id, BASE + i * 420, "timeout")
                .await
                .unwrap();
            assert!(matches!(transition, HealthTransition::Healthy { .. }), "error {}", i);
        }

        assert!(tracker.is_enabled(&db, source_id).await.unwrap());
        // history is kept even though old events no longer count
        assert_eq!(tracker.error_history(&db, source_id, 100).await.unwrap().len(), 30);
    }

    #[tokio::test]
    async fn test_window_boundary_excludes_event_exactly_one_window_old() {
        let (_temp, db) = test_db().await;
        let source_id = test_source(&db, "rl", "edge").await;
        let tracker = HealthTracker::new(3600, 2);

        tracker.record_error(&db, source_id, BASE, "a").await.unwrap();
        let transition = tracker.record_error(&db, source_id, BASE + 3600, "b").await.unwrap();
        assert_eq!(transition, HealthTransition::Healthy { recent_errors: 1 });

        let transition = tracker.record_error(&db, source_id, BASE + 3599 + 3600, "c").await.unwrap();
        assert_eq!(transition, HealthTransition::Disabled { recent_errors: 2 });
    }

    #[tokio::test]
    async fn test_sources_are_tracked_independently() {
        let (_temp, db) = test_db().await;
        let bad = test_source(&db, "rl", "bad").await;
        let good = test_source(&db, "rl", "good").await;
        let tracker = HealthTracker::new(3600, 3);

        for i in 0..3 {
            tracker.record_error(&db, bad, BASE + i, "boom").await.unwrap();
        }
        tracker.record_error(&db, good, BASE, "blip").await.unwrap();

        assert!(!tracker.is_enabled(&db, bad).await.unwrap());
        assert!(tracker.is_enabled(&db, good).await.unwrap());
    }

    #[tokio::test]
    async fn test_operator_enable_resets_window() {
        let (_temp, db) = test_db().await;
        let source_id = test_source(&db, "rl", "flaky").await;
        let tracker = HealthTracker::new(3600, 3);

        for i in 0..3 {
            tracker.record_error(&db, source_id, BASE + i, "boom").await.unwrap();
        }
        assert!(!tracker.is_enabled(&db, source_id).await.unwrap());

        assert!(tracker.enable(&db, source_id, BASE + 10).await.unwrap());
        assert!(tracker.is_enabled(&db, source_id).await.unwrap());
        assert_eq!(tracker.recent_errors(&db, source_id, BASE + 10).await.unwrap(), 0);

        // one more failure must not immediately re-disable it
        let transition = tracker.record_error(&db, source_id, BASE + 20, "boom").await.unwrap();
        assert_eq!(transition, HealthTransition::Healthy { recent_errors: 1 });
    }

    #[tokio::test]
    async fn test_enable_already_enabled_source_is_noop() {
        let (_temp, db) = test_db().await;
        let source_id = test_source(&db, "rl", "fine").await;
        let tracker = HealthTracker::default();

        assert!(!tracker.enable(&db, source_id, BASE).await.unwrap());
        assert!(tracker.enable(&db, 9999, BASE).await.is_err());
    }

    #[tokio::test]
    async fn test_disabled_source_does_not_recover_on_its_own() {
        let (_temp, db) = test_db().await;
        let source_id = test_source(&db, "rl", "flapping").await;
        let tracker = HealthTracker::new(3600, 2);

        tracker.record_error(&db, source_id, BASE, "x").await.unwrap();
        tracker.record_error(&db, source_id, BASE + 1, "x").await.unwrap();

        // long after the window has emptied
        let transition = tracker.reconsider(&db, source_id, BASE + 86_400).await.unwrap();
        assert_eq!(transition, HealthTransition::AlreadyDisabled);
        assert!(!tracker.is_enabled(&db, source_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_reconsider_applies_threshold_without_new_event() {
        let (_temp, db) = test_db().await;
        let source_id = test_source(&db, "rl", "backfilled").await;

        // events written under a laxer threshold
        let lax = HealthTracker::new(3600, 10);
        for i in 0..5 {
            lax.record_error(&db, source_id, BASE + i, "x").await.unwrap();
        }

        let strict = HealthTracker::new(3600, 5);
        let transition = strict.reconsider(&db, source_id, BASE + 10).await.unwrap();
        assert_eq!(transition, HealthTransition::Disabled { recent_errors: 5 });
        assert_eq!(strict.error_history(&db, source_id, 10).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_unknown_source_is_invalid_input() {
        let (_temp, db) = test_db().await;
        let tracker = HealthTracker::default();
        assert!(matches!(
            tracker.is_enabled(&db, 404).await,
            Err(AutopostError::InvalidInput(_))
        ));
    }
}
