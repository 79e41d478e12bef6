//! Collectors and the registry that builds them from stored sources
//!
//! A collector fetches whatever its source currently offers. It does not
//! deduplicate; the content store does that on `(source_id, external_id)`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::types::{NewRawItem, Source, SourceConfig};

pub mod http;

pub use http::HttpJsonCollector;

#[async_trait]
pub trait Collector: Send + Sync {
    fn source_id(&self) -> i64;

    /// Fetch current items; `now` becomes their `collected_at`
    async fn collect(&self, now: i64) -> Result<Vec<NewRawItem>>;
}

/// Builds a collector for a source, or `None` if it cannot handle that source
pub type CollectorFactory = Arc<dyn Fn(&Source) -> Option<Arc<dyn Collector>> + Send + Sync>;

/// Maps source kinds (`rss`, `reddit`, `api`, ...) to collector factories
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    factories: HashMap<String, CollectorFactory>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the collectors that ship with the crate
    pub fn with_defaults(timeout: Duration) -> Self {
        let mut registry = Self::new();
        registry.register(
            "api",
            Arc::new(move |source: &Source| match &source.config {
                SourceConfig::Api {
                    endpoint: Some(endpoint),
                    ..
                } => HttpJsonCollector::new(source, endpoint, timeout)
                    .ok()
                    .map(|c| Arc::new(c) as Arc<dyn Collector>),
                _ => None,
            }),
        );
        registry
    }

    pub fn register(&mut self, kind: &str, factory: CollectorFactory) {
        self.factories.insert(kind.to_string(), factory);
    }

    pub fn build(&self, source: &Source) -> Option<Arc<dyn Collector>> {
        let collector = self
            .factories
            .get(source.config.kind())
            .and_then(|factory| factory(source));

        if collector.is_none() {
            debug!(source_id = source.id, kind = source.config.kind(), "no collector for source");
        }
        collector
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(config: SourceConfig) -> Source {
        Source {
            id: 4,
            niche: "gd".to_string(),
            name: "list".to_string(),
            config,
            poll_interval: None,
            enabled: true,
            disabled_at: None,
            health_reset_at: None,
            created_at: 0,
        }
    }

    #[test]
    fn test_defaults_handle_api_sources_with_endpoint() {
        let registry = CollectorRegistry::with_defaults(Duration::from_secs(5));
        assert_eq!(registry.kinds(), vec!["api".to_string()]);

        let api = source(SourceConfig::Api {
            collector: "pointercrate".to_string(),
            endpoint: Some("https://pointercrate.example/api".to_string()),
        });
        assert_eq!(registry.build(&api).map(|c| c.source_id()), Some(4));

        let no_endpoint = source(SourceConfig::Api {
            collector: "pointercrate".to_string(),
            endpoint: None,
        });
        assert!(registry.build(&no_endpoint).is_none());

        let rss = source(SourceConfig::Rss {
            url: "https://example.com/rss".to_string(),
        });
        assert!(registry.build(&rss).is_none());
    }
}
