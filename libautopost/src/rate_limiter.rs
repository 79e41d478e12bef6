//! Rate limiting for niche accounts
//!
//! Two gates, both recomputed from the post ledger at decision time:
//!
//! - spacing: `last success + min_gap + jitter <= now`
//! - quota: successful posts this calendar month `< monthly_cap`
//!
//! Breaking entries skip spacing (and the optional posting window) but never
//! the quota. The jitter for a given last post is derived from that post's
//! timestamp, so every check against the same history sees the same slot,
//! including after a restart.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::{PostingWindow, RateLimitConfig};
use crate::db::Database;
use crate::error::{AutopostError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied(DenyReason),
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Too soon after the previous post
    Spacing { next_slot: i64 },
    /// Monthly cap reached
    Quota { count: u32, cap: u32 },
    /// Outside the configured posting hours
    OutsideWindow { hour: u32 },
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::Spacing { next_slot } => write!(f, "spacing: next slot at {}", next_slot),
            DenyReason::Quota { count, cap } => write!(f, "monthly quota reached ({}/{})", count, cap),
            DenyReason::OutsideWindow { hour } => write!(f, "outside posting window (hour {} UTC)", hour),
        }
    }
}

/// Per-niche posting gate
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_gap: i64,
    jitter_max: i64,
    monthly_cap: u32,
    posting_window: Option<PostingWindow>,
}

impl RateLimiter {
    /// Create a limiter; gap and jitter are in seconds
    pub fn new(min_gap: u64, jitter_max: u64, monthly_cap: u32) -> Self {
        Self {
            min_gap: min_gap as i64,
            jitter_max: jitter_max as i64,
            monthly_cap,
            posting_window: None,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.min_gap, config.jitter_max, config.monthly_cap)
            .with_posting_window(config.posting_window)
    }

    pub fn with_posting_window(mut self, window: Option<PostingWindow>) -> Self {
        self.posting_window = window;
        self
    }

    pub fn monthly_cap(&self) -> u32 {
        self.monthly_cap
    }

    /// Whether a normal-priority post may go out for `niche` at `now`
    pub async fn can_post(&self, db: &Database, niche: &str, now: i64) -> Result<bool> {
        Ok(self.check(db, niche, now, false).await?.is_allowed())
    }

    /// Evaluate every gate that applies to an entry of the given urgency.
    ///
    /// The quota is checked first: an exhausted month stops breaking posts too.
    pub async fn check(&self, db: &Database, niche: &str, now: i64, breaking: bool) -> Result<RateDecision> {
        let count = self.monthly_count(db, niche, now).await?;
        if count >= self.monthly_cap {
            debug!(niche, count, cap = self.monthly_cap, "monthly quota reached");
            return Ok(RateDecision::Denied(DenyReason::Quota {
                count,
                cap: self.monthly_cap,
            }));
        }

        if breaking {
            return Ok(RateDecision::Allowed);
        }

        if let Some(window) = self.posting_window {
            let hour = utc(now)?.hour();
            if !window.contains_hour(hour) {
                return Ok(RateDecision::Denied(DenyReason::OutsideWindow { hour }));
            }
        }

        if let Some(last) = db.last_successful_post(niche).await? {
            let next_slot = self.next_slot(niche, last);
            if now < next_slot {
                debug!(niche, remaining = next_slot - now, "rate limited");
                return Ok(RateDecision::Denied(DenyReason::Spacing { next_slot }));
            }
        }

        Ok(RateDecision::Allowed)
    }

    /// Account for a successful post made at `posted_at`.
    ///
    /// The ledger row written by the dispatcher is the record; this returns
    /// the earliest time the spacing gate will reopen for the niche.
    pub fn record_post(&self, niche: &str, posted_at: i64) -> i64 {
        let next_slot = self.next_slot(niche, posted_at);
        debug!(niche, posted_at, next_slot, "post recorded");
        next_slot
    }

    /// `last_post + min_gap + jitter(niche, last_post)`
    pub fn next_slot(&self, niche: &str, last_post: i64) -> i64 {
        last_post + self.min_gap + self.jitter(niche, last_post)
    }

    /// Random extra delay in `[0, jitter_max]`, stable for a given last post
    pub fn jitter(&self, niche: &str, last_post: i64) -> i64 {
        if self.jitter_max <= 0 {
            return 0;
        }

        let mut hasher = Sha256::new();
        hasher.update(niche.as_bytes());
        hasher.update(last_post.to_le_bytes());
        let digest = hasher.finalize();

        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        let mut rng = StdRng::seed_from_u64(u64::from_le_bytes(seed));
        rng.gen_range(0..=self.jitter_max)
    }

    /// Successful posts in the calendar month (UTC) containing `now`
    pub async fn monthly_count(&self, db: &Database, niche: &str, now: i64) -> Result<u32> {
        let (start, end) = month_bounds(now)?;
        db.successful_posts_between(niche, start, end).await
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}

fn utc(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| AutopostError::InvalidInput(format!("timestamp out of range: {}", ts)))
}

/// `[first second of the month, first second of the next month)` in UTC
pub fn month_bounds(now: i64) -> Result<(i64, i64)> {
    let now = utc(now)?;
    let (next_year, next_month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };

    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .ok_or_else(|| AutopostError::InvalidInput("invalid month start".to_string()))?;
    let end = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| AutopostError::InvalidInput("invalid month end".to_string()))?;

    Ok((start.timestamp(), end.timestamp()))
}
