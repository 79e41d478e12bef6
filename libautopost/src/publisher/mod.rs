//! Publishing backends
//!
//! A [`Publisher`] sends one post and reports the id the remote side assigned.
//! The dispatcher calls it at most once per attempt and never retries, so
//! implementations must not retry internally either.
//!
//! ```no_run
//! use libautopost::publisher::{DryRunPublisher, Publisher};
//!
//! # async fn example() -> Result<(), libautopost::error::PublishError> {
//! let publisher = DryRunPublisher::new("rocketleague");
//! let post_id = publisher.publish("Patch v2.41 is live", None).await?;
//! println!("posted {}", post_id);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::NicheConfig;
use crate::error::{ConfigError, PublishError, Result};

pub mod mock;
pub mod webhook;

pub use mock::MockPublisher;
pub use webhook::WebhookPublisher;

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `text` with optional media; returns the external post id
    async fn publish(&self, text: &str, media_ref: Option<&str>) -> std::result::Result<String, PublishError>;

    /// Short name used in logs
    fn name(&self) -> &str;
}

/// Logs posts instead of sending them
pub struct DryRunPublisher {
    niche: String,
    counter: AtomicU64,
}

impl DryRunPublisher {
    pub fn new(niche: &str) -> Self {
        Self {
            niche: niche.to_string(),
            counter: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Publisher for DryRunPublisher {
    async fn publish(&self, text: &str, media_ref: Option<&str>) -> std::result::Result<String, PublishError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let post_id = format!("dry-run:{}:{}:{}", self.niche, chrono::Utc::now().timestamp_millis(), n);
        info!(niche = %self.niche, post_id = %post_id, media = ?media_ref, "[dry run] {}", text);
        Ok(post_id)
    }

    fn name(&self) -> &str {
        "dry-run"
    }
}

/// Publisher for a configured niche.
///
/// Dry-run niches (or every niche when `force_dry_run`) log instead of
/// posting; the rest need a `publish_endpoint`.
pub fn for_niche(niche: &NicheConfig, force_dry_run: bool, timeout: Duration) -> Result<Arc<dyn Publisher>> {
    if niche.dry_run || force_dry_run {
        return Ok(Arc::new(DryRunPublisher::new(&niche.name)));
    }

    match &niche.publish_endpoint {
        Some(endpoint) => Ok(Arc::new(WebhookPublisher::new(&niche.name, endpoint, timeout)?)),
        None => Err(ConfigError::MissingField(format!("niches.{}.publish_endpoint", niche.name)).into()),
    }
}
