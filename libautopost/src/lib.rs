//! Autopost - scheduled, rate-limited publishing of collected content
//!
//! Collectors feed a deduplicating content store; formatted items wait in a
//! priority queue; a per-niche dispatcher publishes them within spacing and
//! monthly quota limits and records every attempt in an append-only ledger.

pub mod alert;
pub mod collector;
pub mod config;
pub mod db;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod formatter;
pub mod health;
pub mod ledger;
pub mod logging;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod rate_limiter;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use dispatcher::{Dispatcher, TickOutcome};
pub use error::{AutopostError, Result};
pub use health::{HealthTracker, HealthTransition};
pub use queue::PublishQueue;
pub use rate_limiter::RateLimiter;
pub use scheduler::Scheduler;
pub use types::{IngestOutcome, NewQueueEntry, NewRawItem, Outcome, PostLogRecord, QueueEntry, QueueStatus, Source};
