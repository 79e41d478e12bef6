//! Generic JSON feed collector
//!
//! Reads an endpoint returning a JSON array of items:
//!
//! ```json
//! [{"external_id": "123", "content_type": "level_verified", "title": "...", "url": "..."}]
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::collector::Collector;
use crate::error::{AutopostError, ConfigError, Result};
use crate::types::{NewRawItem, Source};

#[derive(Debug, Deserialize)]
struct FeedItem {
    external_id: String,
    content_type: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    image_url: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

pub struct HttpJsonCollector {
    source_id: i64,
    niche: String,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpJsonCollector {
    pub fn new(source: &Source, endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: format!("sources.{}.endpoint", source.name),
                reason: e.to_string(),
            })?;

        Ok(Self {
            source_id: source.id,
            niche: source.niche.clone(),
            endpoint: endpoint.to_string(),
            client,
        })
    }

    fn to_raw_item(&self, item: FeedItem, now: i64) -> NewRawItem {
        NewRawItem {
            source_id: self.source_id,
            external_id: item.external_id,
            niche: self.niche.clone(),
            content_type: item.content_type,
            title: item.title,
            body: item.body,
            url: item.url,
            image_url: item.image_url,
            author: item.author,
            score: item.score,
            metadata: item
                .metadata
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            collected_at: now,
        }
    }

    fn parse(&self, body: &str, now: i64) -> Result<Vec<NewRawItem>> {
        let items: Vec<FeedItem> = serde_json::from_str(body)
            .map_err(|e| AutopostError::Collect(format!("invalid feed from {}: {}", self.endpoint, e)))?;

        Ok(items
            .into_iter()
            .filter(|item| !item.external_id.trim().is_empty())
            .map(|item| self.to_raw_item(item, now))
            .collect())
    }
}

#[async_trait]
impl Collector for HttpJsonCollector {
    fn source_id(&self) -> i64 {
        self.source_id
    }

    async fn collect(&self, now: i64) -> Result<Vec<NewRawItem>> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| AutopostError::Collect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AutopostError::Collect(format!("{} returned {}", self.endpoint, status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AutopostError::Collect(e.to_string()))?;
        self.parse(&body, now)
    }
}
