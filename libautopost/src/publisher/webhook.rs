//! HTTP bridge to an external posting service
//!
//! POSTs `{"niche", "text", "media_ref"}` as JSON and expects `{"id": "..."}`
//! back. Whatever sits behind the endpoint owns the platform credentials.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{ConfigError, PublishError, Result};
use crate::publisher::Publisher;

pub struct WebhookPublisher {
    niche: String,
    endpoint: String,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    niche: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_ref: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    id: String,
}

impl WebhookPublisher {
    pub fn new(niche: &str, endpoint: &str, timeout: Duration) -> Result<Self> {
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                field: format!("niches.{}.publish_endpoint", niche),
                reason: "must be an http(s) URL".to_string(),
            }
            .into());
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "publish_endpoint".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            niche: niche.to_string(),
            endpoint: endpoint.to_string(),
            timeout,
            client,
        })
    }

    fn map_request_error(&self, e: reqwest::Error) -> PublishError {
        if e.is_timeout() {
            PublishError::Timeout(self.timeout.as_secs())
        } else {
            PublishError::Network(e.to_string())
        }
    }
}

/// Translate a non-success HTTP status into a publish error
fn status_error(status: StatusCode, body: &str) -> PublishError {
    let detail = format!("HTTP {}: {}", status.as_u16(), body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PublishError::Authentication(detail),
        StatusCode::TOO_MANY_REQUESTS => PublishError::RateLimit(detail),
        s if s.is_server_error() => PublishError::Network(detail),
        _ => PublishError::Rejected(detail),
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, text: &str, media_ref: Option<&str>) -> std::result::Result<String, PublishError> {
        let request = PublishRequest {
            niche: &self.niche,
            text,
            media_ref,
        };

        debug!(niche = %self.niche, endpoint = %self.endpoint, "publishing via webhook");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let body: PublishResponse = response
            .json()
            .await
            .map_err(|e| PublishError::Rejected(format!("unreadable response: {}", e)))?;

        if body.id.trim().is_empty() {
            return Err(PublishError::Rejected("empty post id in response".to_string()));
        }
        Ok(body.id)
    }

    fn name(&self) -> &str {
        "webhook"
    }
}
