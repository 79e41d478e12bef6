//! Mock publisher for tests
//!
//! Configurable success, failure and latency, with call counting, so the
//! dispatcher can be exercised without a network.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::PublishError;
use crate::publisher::Publisher;

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub name: String,

    /// Error returned from every publish, if set
    pub error: Option<PublishError>,

    /// Simulated network latency
    pub delay: Duration,

    pub call_count: Arc<Mutex<usize>>,

    /// `(text, media_ref)` of every successful publish
    pub published: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            error: None,
            delay: Duration::from_millis(0),
            call_count: Arc::new(Mutex::new(0)),
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Clones share counters, so a test can keep a handle after moving one into a dispatcher
#[derive(Debug, Clone)]
pub struct MockPublisher {
    config: MockConfig,
}

impl MockPublisher {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    pub fn success() -> Self {
        Self::new(MockConfig::default())
    }

    pub fn failure(error: PublishError) -> Self {
        Self::new(MockConfig {
            error: Some(error),
            ..Default::default()
        })
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self::new(MockConfig {
            delay,
            ..Default::default()
        })
    }

    pub fn call_count(&self) -> usize {
        *self.config.call_count.lock().unwrap()
    }

    pub fn published(&self) -> Vec<(String, Option<String>)> {
        self.config.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, text: &str, media_ref: Option<&str>) -> Result<String, PublishError> {
        let n = {
            let mut count = self.config.call_count.lock().unwrap();
            *count += 1;
            *count
        };

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        if let Some(error) = &self.config.error {
            return Err(error.clone());
        }

        self.config
            .published
            .lock()
            .unwrap()
            .push((text.to_string(), media_ref.map(str::to_string)));
        Ok(format!("{}-post-{}", self.config.name, n))
    }

    fn name(&self) -> &str {
        &self.config.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_success() {
        let publisher = MockPublisher::success();
        let handle = publisher.clone();

        let id = publisher.publish("hello", Some("a.png")).await.unwrap();
        assert_eq!(id, "mock-post-1");
        assert_eq!(handle.call_count(), 1);
        assert_eq!(
            handle.published(),
            vec![("hello".to_string(), Some("a.png".to_string()))]
        );
    }

    #[tokio::test]
    async fn test_mock_failure() {
        let publisher = MockPublisher::failure(PublishError::Rejected("duplicate status".to_string()));

        let err = publisher.publish("hello", None).await.unwrap_err();
        assert_eq!(err.to_string(), "Post rejected: duplicate status");
        assert_eq!(publisher.call_count(), 1);
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_mock_with_delay() {
        let publisher = MockPublisher::with_delay(Duration::from_millis(50));

        let start = std::time::Instant::now();
        publisher.publish("slow", None).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
