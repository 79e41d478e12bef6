//! Collection pipeline: collector → content store → formatter → queue
//!
//! Source failures stop here. A collector error or timeout becomes a health
//! event for the source; only store failures propagate to the caller.
//!
//! Sources are collected concurrently, so the duplicate check and the
//! enqueue that follows it run under a per-niche lock.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::alert::{Alert, Alerter};
use crate::collector::Collector;
use crate::db::Database;
use crate::dedup::Deduplicator;
use crate::error::{AutopostError, Result};
use crate::formatter::Formatter;
use crate::health::{HealthTracker, HealthTransition};
use crate::queue::PublishQueue;
use crate::types::{IngestOutcome, NewQueueEntry, NewRawItem, Source};

/// What one collection run did for one source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    pub source_id: i64,
    pub niche: String,
    pub collected: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub enqueued: usize,
    /// Stored but not queued: same URL or near-identical text already queued
    pub suppressed: usize,
    /// Stored but the formatter declined them
    pub unformatted: usize,
    pub error: Option<String>,
    pub disabled: bool,
    /// The source was already disabled, so nothing was collected
    pub skipped: bool,
}

#[derive(Clone)]
pub struct Collection {
    db: Database,
    health: HealthTracker,
    queue: PublishQueue,
    dedup: Deduplicator,
    formatter: Arc<dyn Formatter>,
    alerter: Alerter,
    timeout: Duration,
    enqueue_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl Collection {
    pub fn new(
        db: Database,
        health: HealthTracker,
        queue: PublishQueue,
        dedup: Deduplicator,
        formatter: Arc<dyn Formatter>,
        alerter: Alerter,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            health,
            queue,
            dedup,
            formatter,
            alerter,
            timeout,
            enqueue_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn enqueue_lock(&self, niche: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.enqueue_locks.lock() {
            Ok(mut locks) => Arc::clone(locks.entry(niche.to_string()).or_default()),
            Err(poisoned) => Arc::clone(poisoned.into_inner().entry(niche.to_string()).or_default()),
        }
    }

    /// Collect one source and queue whatever is new
    pub async fn run_source(&self, source: &Source, collector: &dyn Collector, now: i64) -> Result<CollectionReport> {
        let mut report = CollectionReport {
            source_id: source.id,
            niche: source.niche.clone(),
            ..Default::default()
        };

        if !self.health.is_enabled(&self.db, source.id).await? {
            debug!(source_id = source.id, "source disabled, not collecting");
            report.skipped = true;
            return Ok(report);
        }

        let items = match tokio::time::timeout(self.timeout, collector.collect(now)).await {
            Ok(Ok(items)) => items,
            Ok(Err(e)) => return self.source_failed(source, report, e.to_string(), now).await,
            Err(_) => {
                let detail = format!("collection timed out after {}s", self.timeout.as_secs());
                return self.source_failed(source, report, detail, now).await;
            }
        };

        report.collected = items.len();
        for item in items {
            self.process_item(item, &mut report, now).await?;
        }

        if report.collected > 0 {
            info!(
                source_id = source.id,
                niche = %source.niche,
                collected = report.collected,
                inserted = report.inserted,
                duplicates = report.duplicates,
                enqueued = report.enqueued,
                suppressed = report.suppressed,
                "collection finished"
            );
        }
        Ok(report)
    }

    async fn process_item(&self, item: NewRawItem, report: &mut CollectionReport, now: i64) -> Result<()> {
        let id = match self.db.ingest(&item).await? {
            IngestOutcome::Duplicate(_) => {
                report.duplicates += 1;
                return Ok(());
            }
            IngestOutcome::Inserted(id) => id,
        };
        report.inserted += 1;

        let stored = item.into_stored(id);
        let Some(post) = self.formatter.format(&stored) else {
            debug!(raw_item_id = id, content_type = %stored.content_type, "formatter declined item");
            report.unformatted += 1;
            return Ok(());
        };

        let lock = self.enqueue_lock(&stored.niche);
        let _guard = lock.lock().await;
        if !self.dedup.check(&self.db, &stored, &post.text, now).await?.is_unique() {
            report.suppressed += 1;
            return Ok(());
        }

        let mut entry = NewQueueEntry::new(&stored.niche, &post.text, post.priority(), now).from_raw_item(id);
        entry.media_ref = post.media_ref;
        self.queue.enqueue(&self.db, &entry).await?;
        report.enqueued += 1;
        Ok(())
    }

    async fn source_failed(
        &self,
        source: &Source,
        mut report: CollectionReport,
        detail: String,
        now: i64,
    ) -> Result<CollectionReport> {
        warn!(source_id = source.id, niche = %source.niche, error = %detail, "collection failed");

        let transition = self.health.record_error(&self.db, source.id, now, &detail).await?;
        if let HealthTransition::Disabled { recent_errors } = transition {
            report.disabled = true;
            self.alerter
                .notify(Alert::source_disabled(&source.niche, &source.name, recent_errors, now));
        }

        report.error = Some(detail);
        Ok(report)
    }

    /// Collect several sources concurrently.
    ///
    /// One slow or failing source does not hold up the others. Every task is
    /// awaited; an error, fatal ones first, is returned afterwards.
    pub async fn run_sources(
        &self,
        jobs: Vec<(Source, Arc<dyn Collector>)>,
        now: i64,
    ) -> Result<Vec<CollectionReport>> {
        let mut set = JoinSet::new();
        for (source, collector) in jobs {
            let this = self.clone();
            set.spawn(async move { this.run_source(&source, collector.as_ref(), now).await });
        }

        let mut reports = Vec::new();
        let mut first_error: Option<AutopostError> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    warn!(error = %e, "collection task failed");
                    let keep_existing = matches!(&first_error, Some(existing) if existing.is_fatal());
                    if !keep_existing {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    first_error.get_or_insert(AutopostError::Collect(format!("collection task panicked: {}", e)));
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        reports.sort_by_key(|r| r.source_id);
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::MemoryAlertSink;
    use crate::db::{test_db, test_source};
    use crate::formatter::PlainFormatter;
    use crate::types::QueueStatus;
    use async_trait::async_trait;

    struct StaticCollector {
        source_id: i64,
        items: Vec<NewRawItem>,
    }

    #[async_trait]
    impl Collector for StaticCollector {
        fn source_id(&self) -> i64 {
            self.source_id
        }

        async fn collect(&self, _now: i64) -> Result<Vec<NewRawItem>> {
            Ok(self.items.clone())
        }
    }

    struct FailingCollector(i64);

    #[async_trait]
    impl Collector for FailingCollector {
        fn source_id(&self) -> i64 {
            self.0
        }

        async fn collect(&self, _now: i64) -> Result<Vec<NewRawItem>> {
            Err(AutopostError::Collect("HTTP 503".to_string()))
        }
    }

    struct HangingCollector(i64);

    #[async_trait]
    impl Collector for HangingCollector {
        fn source_id(&self) -> i64 {
            self.0
        }

        async fn collect(&self, _now: i64) -> Result<Vec<NewRawItem>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    fn collection(db: &Database, alerts: &MemoryAlertSink) -> Collection {
        Collection::new(
            db.clone(),
            HealthTracker::new(3600, 10),
            PublishQueue::default(),
            Deduplicator::default(),
            Arc::new(PlainFormatter::default()),
            Alerter::new(vec![Arc::new(alerts.clone())], Duration::from_secs(1)),
            Duration::from_millis(100),
        )
    }

    fn item(source_id: i64, id: &str, content_type: &str, title: &str) -> NewRawItem {
        NewRawItem::new(source_id, id, "rl", content_type, 0)
            .with_title(title)
            .with_url(&format!("https://rl.example/{}", id))
    }

    #[tokio::test]
    async fn test_new_items_are_queued_once() {
        let (_temp, db) = test_db().await;
        let source_id = test_source(&db, "rl", "news").await;
        let source = db.get_source(source_id).await.unwrap().unwrap();
        let collection = collection(&db, &MemoryAlertSink::new());
        let collector = StaticCollector {
            source_id,
            items: vec![
                item(source_id, "a", "patch_notes", "Patch v2.41 is live"),
                item(source_id, "b", "community_clip", "Insane ceiling shot by a Diamond 2"),
            ],
        };

        let first = collection.run_source(&source, &collector, 100).await.unwrap();
        assert_eq!((first.inserted, first.enqueued, first.duplicates), (2, 2, 0));

        let second = collection.run_source(&source, &collector, 200).await.unwrap();
        assert_eq!((second.inserted, second.enqueued, second.duplicates), (0, 0, 2));

        let queued = PublishQueue::default()
            .list(&db, Some("rl"), Some(QueueStatus::Queued), 10)
            .await
            .unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].priority, 2);
        assert_eq!(queued[1].priority, 7);
        assert!(queued.iter().all(|e| e.raw_item_id.is_some()));
    }

    #[tokio::test]
    async fn test_unformattable_items_are_stored_not_queued() {
        let (_temp, db) = test_db().await;
        let source_id = test_source(&db, "rl", "news").await;
        let source = db.get_source(source_id).await.unwrap().unwrap();
        let collector = StaticCollector {
            source_id,
            items: vec![item(source_id, "untitled", "news", "")],
        };

        let report = collection(&db, &MemoryAlertSink::new())
            .run_source(&source, &collector, 100)
            .await
            .unwrap();
        assert_eq!((report.inserted, report.unformatted, report.enqueued), (1, 1, 0));
        assert_eq!(db.count_raw_items(source_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_story_from_second_source_is_suppressed() {
        let (_temp, db) = test_db().await;
        let a = test_source(&db, "rl", "feed-a").await;
        let b = test_source(&db, "rl", "feed-b").await;
        let collection = collection(&db, &MemoryAlertSink::new());

        let story = |source_id| item(source_id, "s", "esports_result", "Team BDS win the RLCS Major");
        let source_a = db.get_source(a).await.unwrap().unwrap();
        let source_b = db.get_source(b).await.unwrap().unwrap();

        collection
            .run_source(&source_a, &StaticCollector { source_id: a, items: vec![story(a)] }, 100)
            .await
            .unwrap();
        let report = collection
            .run_source(&source_b, &StaticCollector { source_id: b, items: vec![story(b)] }, 110)
            .await
            .unwrap();

        assert_eq!((report.inserted, report.suppressed, report.enqueued), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_same_url_collected_concurrently_is_queued_once() {
        let (_temp, db) = test_db().await;
        let collection = collection(&db, &MemoryAlertSink::new());
        let titles = [
            "Season 15 trailer drops",
            "New arena revealed for season 15",
            "Rocket Pass 15 items leaked",
            "Ranked reset dates for next season",
        ];

        // a fresh niche per round keeps earlier rounds out of the similarity check
        for round in 0..10 {
            let niche = format!("rl-{}", round);
            let url = format!("https://rl.example/same-{}", round);
            let mut jobs: Vec<(Source, Arc<dyn Collector>)> = Vec::new();
            for (i, title) in titles.iter().enumerate() {
                let source_id = test_source(&db, &niche, &format!("feed-{}", i)).await;
                let story = NewRawItem::new(source_id, "story", &niche, "news", 0)
                    .with_title(title)
                    .with_url(&url);
                jobs.push((
                    db.get_source(source_id).await.unwrap().unwrap(),
                    Arc::new(StaticCollector {
                        source_id,
                        items: vec![story],
                    }),
                ));
            }

            let reports = collection.run_sources(jobs, 100).await.unwrap();
            let enqueued: usize = reports.iter().map(|r| r.enqueued).sum();
            let suppressed: usize = reports.iter().map(|r| r.suppressed).sum();
            assert_eq!((enqueued, suppressed), (1, titles.len() - 1), "round {}", round);
        }
    }

    #[tokio::test]
    async fn test_failures_feed_health_and_disable_with_alert() {
        let (_temp, db) = test_db().await;
        let source_id = test_source(&db, "rl", "flaky").await;
        let source = db.get_source(source_id).await.unwrap().unwrap();
        let alerts = MemoryAlertSink::new();
        let collection = collection(&db, &alerts);

        for i in 0..9 {
            let report = collection
                .run_source(&source, &FailingCollector(source_id), 1000 + i)
                .await
                .unwrap();
            assert_eq!(report.error.as_deref(), Some("Collection failed: HTTP 503"));
            assert!(!report.disabled);
        }

        let tenth = collection
            .run_source(&source, &FailingCollector(source_id), 1009)
            .await
            .unwrap();
        assert!(tenth.disabled);

        let skipped = collection
            .run_source(&source, &FailingCollector(source_id), 1010)
            .await
            .unwrap();
        assert!(skipped.skipped);

        let received = alerts.wait_for(1).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].title, "Source disabled");
    }

    #[tokio::test]
    async fn test_timeout_counts_as_source_failure() {
        let (_temp, db) = test_db().await;
        let source_id = test_source(&db, "rl", "slow").await;
        let source = db.get_source(source_id).await.unwrap().unwrap();

        let report = collection(&db, &MemoryAlertSink::new())
            .run_source(&source, &HangingCollector(source_id), 100)
            .await
            .unwrap();

        assert!(report.error.unwrap().contains("timed out"));
        let tracker = HealthTracker::new(3600, 10);
        assert_eq!(tracker.recent_errors(&db, source_id, 100).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_slow_source_does_not_block_others() {
        let (_temp, db) = test_db().await;
        let slow = test_source(&db, "rl", "slow").await;
        let fast = test_source(&db, "rl", "fast").await;
        let collection = collection(&db, &MemoryAlertSink::new());

        let jobs: Vec<(Source, Arc<dyn Collector>)> = vec![
            (db.get_source(slow).await.unwrap().unwrap(), Arc::new(HangingCollector(slow))),
            (
                db.get_source(fast).await.unwrap().unwrap(),
                Arc::new(StaticCollector {
                    source_id: fast,
                    items: vec![item(fast, "f", "patch_notes", "Hotfix released")],
                }),
            ),
        ];

        let reports = collection.run_sources(jobs, 100).await.unwrap();
        assert_eq!(reports.len(), 2);
        let fast_report = reports.iter().find(|r| r.source_id == fast).unwrap();
        assert_eq!(fast_report.enqueued, 1);
        let slow_report = reports.iter().find(|r| r.source_id == slow).unwrap();
        assert!(slow_report.error.is_some());
    }
}
