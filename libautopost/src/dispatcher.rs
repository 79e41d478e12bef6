//! Dispatcher
//!
//! One tick per niche walks `Idle → Selecting → Gating → Publishing →
//! Recording → Idle`. Ticks for the same niche are serialized by a per-niche
//! lock; different niches run independently. Between gating and publishing
//! the entry is claimed in the database, so a second dispatcher (even in
//! another process) can never publish it again.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::alert::{Alert, Alerter};
use crate::db::Database;
use crate::error::{AutopostError, PublishError, Result};
use crate::publisher::Publisher;
use crate::queue::PublishQueue;
use crate::rate_limiter::{DenyReason, RateDecision, RateLimiter};
use crate::types::{Outcome, QueueEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Selecting,
    Gating,
    Publishing,
    Recording,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DispatchState::Idle => "idle",
            DispatchState::Selecting => "selecting",
            DispatchState::Gating => "gating",
            DispatchState::Publishing => "publishing",
            DispatchState::Recording => "recording",
        };
        f.write_str(s)
    }
}

/// How a tick ended
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing eligible
    Idle,
    /// Rate limiter said no; the entry stays queued
    Deferred { entry_id: i64, reason: DenyReason },
    /// Another dispatcher claimed the entry first
    Contended { entry_id: i64 },
    Posted { entry_id: i64, external_post_id: String },
    Failed { entry_id: i64, error: String },
}

pub struct Dispatcher {
    db: Database,
    queue: PublishQueue,
    limiter: RateLimiter,
    alerter: Alerter,
    publish_timeout: Duration,
    publishers: HashMap<String, Arc<dyn Publisher>>,
    locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    states: Mutex<HashMap<String, DispatchState>>,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        queue: PublishQueue,
        limiter: RateLimiter,
        alerter: Alerter,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            db,
            queue,
            limiter,
            alerter,
            publish_timeout,
            publishers: HashMap::new(),
            locks: HashMap::new(),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Register the publisher for a niche
    pub fn with_publisher(mut self, niche: &str, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers.insert(niche.to_string(), publisher);
        self.locks
            .insert(niche.to_string(), Arc::new(tokio::sync::Mutex::new(())));
        self
    }

    pub fn niches(&self) -> Vec<String> {
        let mut niches: Vec<String> = self.publishers.keys().cloned().collect();
        niches.sort();
        niches
    }

    pub fn state(&self, niche: &str) -> DispatchState {
        self.states
            .lock()
            .map(|states| states.get(niche).copied().unwrap_or(DispatchState::Idle))
            .unwrap_or(DispatchState::Idle)
    }

    fn set_state(&self, niche: &str, state: DispatchState) {
        if let Ok(mut states) = self.states.lock() {
            debug!(niche, state = %state, "dispatch state");
            states.insert(niche.to_string(), state);
        }
    }

    /// How long a claim may stand before the entry counts as abandoned
    pub fn claim_lease(&self) -> u64 {
        (self.publish_timeout.as_secs() * 2).max(60)
    }

    /// Fail entries whose dispatcher died mid-publish
    pub async fn recover_abandoned(&self, now: i64) -> Result<Vec<i64>> {
        self.queue.recover_abandoned(&self.db, self.claim_lease(), now).await
    }

    /// Run one dispatch cycle for a niche
    pub async fn tick(&self, niche: &str, now: i64) -> Result<TickOutcome> {
        let (Some(publisher), Some(lock)) = (self.publishers.get(niche), self.locks.get(niche)) else {
            return Err(AutopostError::InvalidInput(format!("No publisher for niche '{}'", niche)));
        };

        let _guard = lock.lock().await;
        let result = self.run_tick(niche, publisher.as_ref(), now).await;
        self.set_state(niche, DispatchState::Idle);
        result
    }

    async fn run_tick(&self, niche: &str, publisher: &dyn Publisher, now: i64) -> Result<TickOutcome> {
        self.set_state(niche, DispatchState::Selecting);
        let Some(entry) = self.queue.next_eligible(&self.db, niche, now).await? else {
            return Ok(TickOutcome::Idle);
        };

        self.set_state(niche, DispatchState::Gating);
        if let RateDecision::Denied(reason) = self.limiter.check(&self.db, niche, now, entry.is_breaking()).await? {
            debug!(niche, entry_id = entry.id, %reason, "dispatch deferred");
            return Ok(TickOutcome::Deferred {
                entry_id: entry.id,
                reason,
            });
        }

        if !self.queue.claim(&self.db, entry.id, now).await? {
            debug!(niche, entry_id = entry.id, "entry claimed elsewhere");
            return Ok(TickOutcome::Contended { entry_id: entry.id });
        }

        self.set_state(niche, DispatchState::Publishing);
        let started = Instant::now();
        let published = self.publish(publisher, &entry).await;
        // the outcome is stamped when publish returned, not when the tick began
        let finished_at = now + started.elapsed().as_secs() as i64;

        self.set_state(niche, DispatchState::Recording);
        self.record(niche, &entry, published, finished_at).await
    }

    async fn publish(&self, publisher: &dyn Publisher, entry: &QueueEntry) -> std::result::Result<String, PublishError> {
        match tokio::time::timeout(
            self.publish_timeout,
            publisher.publish(&entry.text, entry.media_ref.as_deref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(self.publish_timeout.as_secs())),
        }
    }

    async fn record(
        &self,
        niche: &str,
        entry: &QueueEntry,
        published: std::result::Result<String, PublishError>,
        now: i64,
    ) -> Result<TickOutcome> {
        match published {
            Ok(external_post_id) => {
                let outcome = Outcome::Posted {
                    external_post_id: external_post_id.clone(),
                };
                self.queue.mark(&self.db, entry.id, &outcome, now).await?;
                let next_slot = self.limiter.record_post(niche, now);
                info!(
                    niche,
                    entry_id = entry.id,
                    post_id = %external_post_id,
                    priority = entry.priority,
                    next_slot,
                    "posted"
                );
                Ok(TickOutcome::Posted {
                    entry_id: entry.id,
                    external_post_id,
                })
            }
            Err(e) => {
                let error = e.to_string();
                let outcome = Outcome::Failed { error: error.clone() };
                self.queue.mark(&self.db, entry.id, &outcome, now).await?;
                error!(niche, entry_id = entry.id, error = %error, "publish failed");
                self.alerter.notify(Alert::publish_failed(niche, entry.id, &error, now));
                Ok(TickOutcome::Failed {
                    entry_id: entry.id,
                    error,
                })
            }
        }
    }
}
