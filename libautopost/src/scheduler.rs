//! Cooperative scheduler
//!
//! A single loop decides what is due: collection per source, a dispatch
//! tick per niche, the staleness sweep with abandoned-claim recovery, and
//! dry-spell checks. Niches dispatch concurrently; a niche never has two
//! ticks in flight. Collection runs in background tasks whose reports are
//! picked up in later rounds, so dispatch never waits on collector I/O.
//! A store failure halts the loop; every other error is logged and
//! scheduling continues.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::alert::{Alert, Alerter};
use crate::collector::{Collector, CollectorRegistry};
use crate::config::{Config, SchedulingConfig};
use crate::db::Database;
use crate::dedup::Deduplicator;
use crate::dispatcher::{Dispatcher, TickOutcome};
use crate::error::Result;
use crate::formatter::Formatter;
use crate::health::HealthTracker;
use crate::pipeline::{Collection, CollectionReport};
use crate::publisher::Publisher;
use crate::queue::PublishQueue;
use crate::rate_limiter::RateLimiter;
use crate::types::Source;

/// Everything one scheduler round did
#[derive(Debug, Default)]
pub struct RoundReport {
    /// Reports of collection runs that finished since the previous round
    pub collections: Vec<CollectionReport>,
    /// Sources whose collection was started this round
    pub collections_started: usize,
    pub dispatches: Vec<(String, TickOutcome)>,
    pub stale_skipped: u64,
    pub recovered: Vec<i64>,
    pub dry_spells: Vec<String>,
}

/// A collection run still in flight, with the sources it covers
struct RunningCollection {
    sources: Vec<i64>,
    handle: JoinHandle<Result<Vec<CollectionReport>>>,
}

pub struct Scheduler {
    config: SchedulingConfig,
    db: Database,
    queue: PublishQueue,
    collection: Collection,
    dispatcher: Arc<Dispatcher>,
    registry: CollectorRegistry,
    alerter: Alerter,
    started_at: i64,
    last_collected: HashMap<i64, i64>,
    collecting: Vec<RunningCollection>,
    last_dispatch: Option<i64>,
    last_sweep: Option<i64>,
    /// Last-success time each niche was last warned about, to warn once per dry spell
    dry_spell_warned: HashMap<String, Option<i64>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulingConfig,
        db: Database,
        queue: PublishQueue,
        collection: Collection,
        dispatcher: Arc<Dispatcher>,
        registry: CollectorRegistry,
        alerter: Alerter,
        started_at: i64,
    ) -> Self {
        Self {
            config,
            db,
            queue,
            collection,
            dispatcher,
            registry,
            alerter,
            started_at,
            last_collected: HashMap::new(),
            collecting: Vec::new(),
            last_dispatch: None,
            last_sweep: None,
            dry_spell_warned: HashMap::new(),
        }
    }

    /// Wire every component from configuration
    pub fn from_config(
        config: &Config,
        db: Database,
        publishers: Vec<(String, Arc<dyn Publisher>)>,
        formatter: Arc<dyn Formatter>,
        registry: CollectorRegistry,
        alerter: Alerter,
        started_at: i64,
    ) -> Self {
        let scheduling = &config.scheduling;
        let queue = PublishQueue::new(scheduling.stale_after);

        let collection = Collection::new(
            db.clone(),
            HealthTracker::from_config(&config.health),
            queue,
            Deduplicator::from_config(&config.dedup),
            formatter,
            alerter.clone(),
            Duration::from_secs(scheduling.collect_timeout),
        );

        let dispatcher = publishers.into_iter().fold(
            Dispatcher::new(
                db.clone(),
                queue,
                RateLimiter::from_config(&config.rate_limit),
                alerter.clone(),
                Duration::from_secs(scheduling.publish_timeout),
            ),
            |dispatcher, (niche, publisher)| dispatcher.with_publisher(&niche, publisher),
        );

        Self::new(
            scheduling.clone(),
            db,
            queue,
            collection,
            Arc::new(dispatcher),
            registry,
            alerter,
            started_at,
        )
    }

    pub fn niches(&self) -> Vec<String> {
        self.dispatcher.niches()
    }

    /// Run every step once regardless of intervals.
    ///
    /// Dispatch still does not wait for collection, but the round only
    /// returns once every collection it started has finished.
    pub async fn run_once(&mut self, now: i64) -> Result<RoundReport> {
        self.round(now, true).await
    }

    /// Loop until `shutdown` is set or a fatal error occurs
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        info!(
            niches = ?self.dispatcher.niches(),
            dispatch_interval = self.config.dispatch_interval,
            "scheduler started"
        );

        while !shutdown.load(Ordering::SeqCst) {
            let now = chrono::Utc::now().timestamp();
            if let Err(e) = self.round(now, false).await {
                error!(error = %e, "scheduler halted");
                self.abort_collections();
                return Err(e);
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        self.abort_collections();
        info!("scheduler stopped");
        Ok(())
    }

    async fn round(&mut self, now: i64, force: bool) -> Result<RoundReport> {
        let mut report = RoundReport::default();

        if force || due(self.last_sweep, self.config.stale_sweep_interval, now) {
            report.stale_skipped = keep_going(self.queue.skip_stale(&self.db, None, now).await)?.unwrap_or(0);
            report.recovered = keep_going(self.dispatcher.recover_abandoned(now).await)?.unwrap_or_default();
            self.last_sweep = Some(now);
        }

        report.collections = self.harvest_collections(false).await?;
        report.collections_started = self.start_collections(now, force).await?;

        if force || due(self.last_dispatch, self.config.dispatch_interval, now) {
            report.dispatches = self.dispatch_all(now).await?;
            self.last_dispatch = Some(now);
        }

        if force {
            report.collections.extend(self.harvest_collections(true).await?);
            report.collections.sort_by_key(|r| r.source_id);
        }

        if let Some(hours) = self.config.dry_spell_hours {
            report.dry_spells = self.check_dry_spells(hours, now).await?;
        }

        Ok(report)
    }

    /// Spawn collection for every due source not already being collected
    async fn start_collections(&mut self, now: i64, force: bool) -> Result<usize> {
        let sources = self.db.list_sources(None, true).await?;
        let in_flight: HashSet<i64> = self
            .collecting
            .iter()
            .flat_map(|running| running.sources.iter().copied())
            .collect();

        let mut jobs: Vec<(Source, Arc<dyn Collector>)> = Vec::new();
        for source in sources {
            if in_flight.contains(&source.id) {
                continue;
            }
            let interval = source.poll_interval.unwrap_or(self.config.collect_interval);
            if !force && !due(self.last_collected.get(&source.id).copied(), interval, now) {
                continue;
            }
            let Some(collector) = self.registry.build(&source) else {
                continue;
            };
            self.last_collected.insert(source.id, now);
            jobs.push((source, collector));
        }

        if jobs.is_empty() {
            return Ok(0);
        }
        debug!(sources = jobs.len(), "collecting");

        let started = jobs.len();
        let sources = jobs.iter().map(|(source, _)| source.id).collect();
        let collection = self.collection.clone();
        let handle = tokio::spawn(async move { collection.run_sources(jobs, now).await });
        self.collecting.push(RunningCollection { sources, handle });
        Ok(started)
    }

    /// Collect reports from finished runs, or from every run when `wait` is set
    async fn harvest_collections(&mut self, wait: bool) -> Result<Vec<CollectionReport>> {
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.collecting)
            .into_iter()
            .partition(|running| wait || running.handle.is_finished());
        self.collecting = pending;

        let mut reports = Vec::new();
        for running in done {
            match running.handle.await {
                Ok(result) => reports.extend(keep_going(result)?.unwrap_or_default()),
                Err(e) => warn!(sources = ?running.sources, error = %e, "collection task panicked"),
            }
        }
        Ok(reports)
    }

    fn abort_collections(&mut self) {
        for running in self.collecting.drain(..) {
            running.handle.abort();
        }
    }

    async fn dispatch_all(&self, now: i64) -> Result<Vec<(String, TickOutcome)>> {
        let mut set = JoinSet::new();
        for niche in self.dispatcher.niches() {
            let dispatcher = Arc::clone(&self.dispatcher);
            set.spawn(async move {
                let result = dispatcher.tick(&niche, now).await;
                (niche, result)
            });
        }

        let mut outcomes = Vec::new();
        let mut fatal = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((niche, Ok(outcome))) => outcomes.push((niche, outcome)),
                Ok((niche, Err(e))) if e.is_fatal() => {
                    error!(niche = %niche, error = %e, "dispatch failed");
                    fatal.get_or_insert(e);
                }
                Ok((niche, Err(e))) => warn!(niche = %niche, error = %e, "dispatch tick error"),
                Err(e) => warn!(error = %e, "dispatch task panicked"),
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(outcomes)
    }

    /// Warn once per niche when nothing has been posted for `hours`
    async fn check_dry_spells(&mut self, hours: u64, now: i64) -> Result<Vec<String>> {
        let limit = hours as i64 * 3600;
        let mut warned = Vec::new();

        for niche in self.dispatcher.niches() {
            let last = self.db.last_successful_post(&niche).await?;
            let since = last.unwrap_or(0).max(self.started_at);
            if now - since < limit {
                continue;
            }
            if self.dry_spell_warned.get(&niche) == Some(&last) {
                continue;
            }

            warn!(niche = %niche, hours, "no successful post in dry spell window");
            self.alerter.notify(Alert::dry_spell(&niche, hours, now));
            self.dry_spell_warned.insert(niche.clone(), last);
            warned.push(niche);
        }
        Ok(warned)
    }
}

fn due(last: Option<i64>, interval: u64, now: i64) -> bool {
    match last {
        None => true,
        Some(last) => now - last >= interval as i64,
    }
}

/// Propagate fatal errors, log and swallow the rest
fn keep_going<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!(error = %e, "scheduler step failed");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::MemoryAlertSink;
    use crate::db::{test_db, test_source};
    use crate::formatter::PlainFormatter;
    use crate::publisher::MockPublisher;
    use crate::types::{NewQueueEntry, NewRawItem, QueueStatus};
    use async_trait::async_trait;

    const NOW: i64 = 1_742_040_000;

    struct OneItem(i64);

    #[async_trait]
    impl Collector for OneItem {
        fn source_id(&self) -> i64 {
            self.0
        }

        async fn collect(&self, now: i64) -> Result<Vec<NewRawItem>> {
            Ok(vec![NewRawItem::new(self.0, "item-1", "rl", "patch_notes", now)
                .with_title("Patch v2.41 is live")
                .with_url("https://rl.example/patch")])
        }
    }

    struct SlowCollector(i64);

    #[async_trait]
    impl Collector for SlowCollector {
        fn source_id(&self) -> i64 {
            self.0
        }

        async fn collect(&self, _now: i64) -> Result<Vec<NewRawItem>> {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(Vec::new())
        }
    }

    fn registry_of<C, F>(build: F) -> CollectorRegistry
    where
        C: Collector + 'static,
        F: Fn(i64) -> C + Send + Sync + 'static,
    {
        let mut registry = CollectorRegistry::new();
        registry.register(
            "rss",
            Arc::new(move |source: &Source| Some(Arc::new(build(source.id)) as Arc<dyn Collector>)),
        );
        registry
    }

    fn scheduler_with(
        db: &Database,
        alerts: &MemoryAlertSink,
        config: SchedulingConfig,
        registry: CollectorRegistry,
    ) -> Scheduler {
        let alerter = Alerter::new(vec![Arc::new(alerts.clone())], Duration::from_secs(1));
        let queue = PublishQueue::new(config.stale_after);
        let collection = Collection::new(
            db.clone(),
            HealthTracker::new(3600, 10),
            queue,
            Deduplicator::default(),
            Arc::new(PlainFormatter::default()),
            alerter.clone(),
            Duration::from_secs(1),
        );
        let dispatcher = Dispatcher::new(
            db.clone(),
            queue,
            RateLimiter::new(1200, 0, 1500),
            alerter.clone(),
            Duration::from_secs(1),
        )
        .with_publisher("rl", Arc::new(MockPublisher::success()));

        Scheduler::new(config, db.clone(), queue, collection, Arc::new(dispatcher), registry, alerter, NOW)
    }

    fn scheduler(db: &Database, alerts: &MemoryAlertSink, config: SchedulingConfig) -> Scheduler {
        scheduler_with(db, alerts, config, registry_of(OneItem))
    }

    #[tokio::test]
    async fn test_run_once_collects_and_posts() {
        let (_temp, db) = test_db().await;
        test_source(&db, "rl", "news").await;
        let mut s = scheduler(&db, &MemoryAlertSink::new(), SchedulingConfig::default());

        let report = s.run_once(NOW).await.unwrap();
        assert_eq!(report.collections_started, 1);
        assert_eq!(report.collections.len(), 1);
        assert_eq!(report.collections[0].enqueued, 1);

        // the item is posted by this round or the next, never twice
        let again = s.run_once(NOW + 60).await.unwrap();
        assert_eq!(again.collections[0].duplicates, 1);
        let queued = PublishQueue::default()
            .list(&db, Some("rl"), Some(QueueStatus::Posted), 10)
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(db.attempts_for_entry(queued[0].id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_intervals_gate_work_between_rounds() {
        let (_temp, db) = test_db().await;
        test_source(&db, "rl", "news").await;
        let mut s = scheduler(&db, &MemoryAlertSink::new(), SchedulingConfig::default());

        let first = s.round(NOW, false).await.unwrap();
        assert_eq!(first.collections_started, 1);
        assert_eq!(first.dispatches.len(), 1);

        let soon = s.round(NOW + 10, false).await.unwrap();
        assert_eq!(soon.collections_started, 0);
        assert!(soon.dispatches.is_empty());

        s.harvest_collections(true).await.unwrap();
        let later = s.round(NOW + 900, false).await.unwrap();
        assert_eq!(later.collections_started, 1);
        assert_eq!(later.dispatches.len(), 1);
    }

    #[tokio::test]
    async fn test_slow_collection_does_not_delay_dispatch() {
        let (_temp, db) = test_db().await;
        test_source(&db, "rl", "slow-feed").await;
        let ready = PublishQueue::default()
            .enqueue(&db, &NewQueueEntry::new("rl", "Hotfix is live", 2, NOW - 60))
            .await
            .unwrap();
        let mut s = scheduler_with(
            &db,
            &MemoryAlertSink::new(),
            SchedulingConfig::default(),
            registry_of(SlowCollector),
        );

        // collection times out after 1s; the entry must be out well before that
        let watcher = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            PublishQueue::default().get(&db, ready).await.unwrap().unwrap().status
        };
        let (report, status_mid_collection) = tokio::join!(s.run_once(NOW), watcher);
        let report = report.unwrap();

        assert_eq!(status_mid_collection, QueueStatus::Posted);
        assert!(matches!(report.dispatches[0].1, TickOutcome::Posted { entry_id, .. } if entry_id == ready));
        assert!(report.collections[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_source_in_flight_is_not_started_twice() {
        let (_temp, db) = test_db().await;
        test_source(&db, "rl", "slow-feed").await;
        let config = SchedulingConfig {
            collect_interval: 1,
            ..Default::default()
        };
        let mut s = scheduler_with(&db, &MemoryAlertSink::new(), config, registry_of(SlowCollector));

        assert_eq!(s.round(NOW, false).await.unwrap().collections_started, 1);
        assert_eq!(s.round(NOW + 5, false).await.unwrap().collections_started, 0);
        s.abort_collections();
    }

    #[tokio::test]
    async fn test_sweep_skips_stale_entries() {
        let (_temp, db) = test_db().await;
        let mut s = scheduler(&db, &MemoryAlertSink::new(), SchedulingConfig::default());
        let queue = PublishQueue::default();
        let id = queue
            .enqueue(&db, &NewQueueEntry::new("gd", "old filler", 8, NOW - 7 * 3600))
            .await
            .unwrap();

        let report = s.run_once(NOW).await.unwrap();
        assert_eq!(report.stale_skipped, 1);
        assert_eq!(queue.get(&db, id).await.unwrap().unwrap().status, QueueStatus::Skipped);
    }

    #[tokio::test]
    async fn test_dry_spell_warns_once() {
        let (_temp, db) = test_db().await;
        let alerts = MemoryAlertSink::new();
        let config = SchedulingConfig {
            dry_spell_hours: Some(2),
            ..Default::default()
        };
        let mut s = scheduler(&db, &alerts, config);

        assert!(s.run_once(NOW + 3600).await.unwrap().dry_spells.is_empty());
        assert_eq!(s.run_once(NOW + 2 * 3600).await.unwrap().dry_spells, vec!["rl".to_string()]);
        assert!(s.run_once(NOW + 3 * 3600).await.unwrap().dry_spells.is_empty());

        let received = alerts.wait_for(1).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].title, "Dry spell");
    }

    #[test]
    fn test_due() {
        assert!(due(None, 60, 0));
        assert!(!due(Some(100), 60, 159));
        assert!(due(Some(100), 60, 160));
    }
}
