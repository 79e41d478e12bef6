//! Core types for Autopost
//!
//! All timestamps are UTC unix seconds.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Breaking news: skips the spacing gate, still bound by quota and staleness.
pub const BREAKING_PRIORITY: i64 = 1;

/// Priority for content types without an explicit mapping.
pub const DEFAULT_PRIORITY: i64 = 5;

/// Type-specific source configuration, validated when loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Rss {
        url: String,
    },
    Reddit {
        subreddit: String,
        #[serde(default)]
        min_score: i64,
    },
    Youtube {
        channel_id: String,
    },
    Twitter {
        handle: String,
    },
    Api {
        collector: String,
        #[serde(default)]
        endpoint: Option<String>,
    },
    Scraper {
        url: String,
    },
}

impl SourceConfig {
    /// Tag stored in the `kind` column
    pub fn kind(&self) -> &'static str {
        match self {
            SourceConfig::Rss { .. } => "rss",
            SourceConfig::Reddit { .. } => "reddit",
            SourceConfig::Youtube { .. } => "youtube",
            SourceConfig::Twitter { .. } => "twitter",
            SourceConfig::Api { .. } => "api",
            SourceConfig::Scraper { .. } => "scraper",
        }
    }

    /// Check the fields each variant depends on.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let (field, value) = match self {
            SourceConfig::Rss { url } | SourceConfig::Scraper { url } => ("url", url),
            SourceConfig::Reddit { subreddit, .. } => ("subreddit", subreddit),
            SourceConfig::Youtube { channel_id } => ("channel_id", channel_id),
            SourceConfig::Twitter { handle } => ("handle", handle),
            SourceConfig::Api { collector, endpoint } => {
                if let Some(endpoint) = endpoint {
                    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                        return Err(format!("endpoint must be an http(s) URL, got '{}'", endpoint));
                    }
                }
                ("collector", collector)
            }
        };

        if value.trim().is_empty() {
            return Err(format!("{} source requires a non-empty {}", self.kind(), field));
        }

        match self {
            SourceConfig::Rss { url } | SourceConfig::Scraper { url }
                if !url.starts_with("http://") && !url.starts_with("https://") =>
            {
                Err(format!("url must be an http(s) URL, got '{}'", url))
            }
            _ => Ok(()),
        }
    }
}

/// An upstream origin of content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub id: i64,
    pub niche: String,
    pub name: String,
    pub config: SourceConfig,
    /// Seconds between collection runs; `None` uses the scheduler default
    pub poll_interval: Option<u64>,
    pub enabled: bool,
    pub disabled_at: Option<i64>,
    /// Errors before this instant no longer count toward the health threshold
    pub health_reset_at: Option<i64>,
    pub created_at: i64,
}

/// A source as declared in configuration, before it has an id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewSource {
    pub niche: String,
    pub name: String,
    #[serde(flatten)]
    pub config: SourceConfig,
    #[serde(default)]
    pub poll_interval: Option<u64>,
}

/// An item as produced by a collector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NewRawItem {
    pub source_id: i64,
    pub external_id: String,
    pub niche: String,
    pub content_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub collected_at: i64,
}

impl NewRawItem {
    pub fn new(source_id: i64, external_id: &str, niche: &str, content_type: &str, collected_at: i64) -> Self {
        Self {
            source_id,
            external_id: external_id.to_string(),
            niche: niche.to_string(),
            content_type: content_type.to_string(),
            metadata: serde_json::Value::Object(Default::default()),
            collected_at,
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    /// Attach the id the store assigned.
    pub fn into_stored(self, id: i64) -> RawItem {
        RawItem {
            id,
            source_id: self.source_id,
            external_id: self.external_id,
            niche: self.niche,
            content_type: self.content_type,
            title: self.title,
            body: self.body,
            url: self.url,
            image_url: self.image_url,
            author: self.author,
            score: self.score,
            metadata: self.metadata,
            collected_at: self.collected_at,
        }
    }
}

/// A stored, immutable piece of discovered content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawItem {
    pub id: i64,
    pub source_id: i64,
    pub external_id: String,
    pub niche: String,
    pub content_type: String,
    pub title: String,
    pub body: String,
    pub url: String,
    pub image_url: String,
    pub author: String,
    pub score: i64,
    pub metadata: serde_json::Value,
    pub collected_at: i64,
}

/// Result of offering an item to the content store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted(i64),
    /// Already stored under the same `(source_id, external_id)`; carries the existing id
    Duplicate(i64),
}

impl IngestOutcome {
    pub fn id(&self) -> i64 {
        match self {
            IngestOutcome::Inserted(id) | IngestOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, IngestOutcome::Inserted(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Posted,
    Failed,
    Skipped,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Posted => "posted",
            QueueStatus::Failed => "failed",
            QueueStatus::Skipped => "skipped",
        }
    }

    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueueStatus::Queued)
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(QueueStatus::Queued),
            "posted" => Ok(QueueStatus::Posted),
            "failed" => Ok(QueueStatus::Failed),
            "skipped" => Ok(QueueStatus::Skipped),
            other => Err(format!("unknown queue status '{}'", other)),
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A formatted post about to enter the queue
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueEntry {
    pub niche: String,
    pub raw_item_id: Option<i64>,
    pub text: String,
    pub media_ref: Option<String>,
    pub priority: i64,
    pub scheduled_at: Option<i64>,
    pub created_at: i64,
}

impl NewQueueEntry {
    pub fn new(niche: &str, text: &str, priority: i64, created_at: i64) -> Self {
        Self {
            niche: niche.to_string(),
            raw_item_id: None,
            text: text.to_string(),
            media_ref: None,
            priority,
            scheduled_at: None,
            created_at,
        }
    }

    pub fn scheduled_at(mut self, at: i64) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn from_raw_item(mut self, raw_item_id: i64) -> Self {
        self.raw_item_id = Some(raw_item_id);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub id: i64,
    pub niche: String,
    pub raw_item_id: Option<i64>,
    pub text: String,
    pub media_ref: Option<String>,
    pub priority: i64,
    pub status: QueueStatus,
    pub scheduled_at: Option<i64>,
    /// Set while a dispatcher holds the entry between gating and recording
    pub claimed_at: Option<i64>,
    pub created_at: i64,
    pub posted_at: Option<i64>,
}

impl QueueEntry {
    pub fn is_breaking(&self) -> bool {
        self.priority == BREAKING_PRIORITY
    }
}

/// How a dispatch attempt (or a sweep) resolved a queue entry
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Posted { external_post_id: String },
    Failed { error: String },
    Skipped,
}

impl Outcome {
    pub fn status(&self) -> QueueStatus {
        match self {
            Outcome::Posted { .. } => QueueStatus::Posted,
            Outcome::Failed { .. } => QueueStatus::Failed,
            Outcome::Skipped => QueueStatus::Skipped,
        }
    }
}

/// Immutable record of one dispatch attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostLogRecord {
    pub id: Option<i64>,
    pub queue_entry_id: i64,
    pub niche: String,
    pub external_post_id: Option<String>,
    pub text: String,
    pub posted_at: i64,
    pub error: Option<String>,
}

impl PostLogRecord {
    pub fn is_success(&self) -> bool {
        self.external_post_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceErrorEvent {
    pub id: i64,
    pub source_id: i64,
    pub occurred_at: i64,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_config_kind_tags() {
        let rss = SourceConfig::Rss {
            url: "https://example.com/feed".to_string(),
        };
        assert_eq!(rss.kind(), "rss");

        let json = serde_json::to_value(&rss).unwrap();
        assert_eq!(json["type"], "rss");
    }

    #[test]
    fn test_source_config_deserializes_from_tagged_toml() {
        let parsed: NewSource = toml::from_str(
            r#"
            niche = "rocketleague"
            name = "r/RocketLeague"
            type = "reddit"
            subreddit = "RocketLeague"
            min_score = 500
            poll_interval = 600
            "#,
        )
        .unwrap();

        assert_eq!(parsed.poll_interval, Some(600));
        assert_eq!(
            parsed.config,
            SourceConfig::Reddit {
                subreddit: "RocketLeague".to_string(),
                min_score: 500
            }
        );
    }

    #[test]
    fn test_source_config_validation() {
        assert!(SourceConfig::Rss {
            url: "https://example.com/rss".to_string()
        }
        .validate()
        .is_ok());

        let err = SourceConfig::Rss {
            url: "ftp://example.com".to_string(),
        }
        .validate()
        .unwrap_err();
        assert!(err.contains("http(s)"));

        let err = SourceConfig::Twitter {
            handle: "  ".to_string(),
        }
        .validate()
        .unwrap_err();
        assert!(err.contains("handle"));

        let err = SourceConfig::Api {
            collector: "pointercrate".to_string(),
            endpoint: Some("localhost:8080".to_string()),
        }
        .validate()
        .unwrap_err();
        assert!(err.contains("endpoint"));
    }

    #[test]
    fn test_queue_status_parse() {
        for status in [
            QueueStatus::Queued,
            QueueStatus::Posted,
            QueueStatus::Failed,
            QueueStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
        assert!("pending".parse::<QueueStatus>().is_err());
        assert!(!QueueStatus::Queued.is_terminal());
        assert!(QueueStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_ingest_outcome_accessors() {
        assert!(IngestOutcome::Inserted(3).is_new());
        assert!(!IngestOutcome::Duplicate(3).is_new());
        assert_eq!(IngestOutcome::Duplicate(9).id(), 9);
    }
}
