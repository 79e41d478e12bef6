//! Configuration management for Autopost

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};
use crate::types::NewSource;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub niches: Vec<NicheConfig>,
    #[serde(default)]
    pub sources: Vec<NewSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Intervals are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulingConfig {
    pub dispatch_interval: u64,
    pub collect_interval: u64,
    pub stale_sweep_interval: u64,
    pub stale_after: u64,
    pub publish_timeout: u64,
    pub collect_timeout: u64,
    pub dry_spell_hours: Option<u64>,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: 120,
            collect_interval: 900,
            stale_sweep_interval: 6 * 3600,
            stale_after: 6 * 3600,
            publish_timeout: 30,
            collect_timeout: 60,
            dry_spell_hours: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub min_gap: u64,
    pub jitter_max: u64,
    pub monthly_cap: u32,
    pub posting_window: Option<PostingWindow>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_gap: 20 * 60,
            jitter_max: 120,
            monthly_cap: 1500,
            posting_window: None,
        }
    }
}

/// UTC hours `[start_hour, end_hour)` during which non-breaking posts may go out
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostingWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl PostingWindow {
    pub fn contains_hour(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            // wraps midnight, e.g. 22..6
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub window: u64,
    pub threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: 3600,
            threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DedupConfig {
    pub similarity_threshold: f64,
    pub similarity_hours: u64,
    pub cross_source_url: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.65,
            similarity_hours: 24,
            cross_source_url: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlertsConfig {
    pub discord_webhook: Option<String>,
    pub timeout: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            discord_webhook: None,
            timeout: 10,
        }
    }
}

/// One independently scheduled and rate-limited publishing account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NicheConfig {
    pub name: String,
    #[serde(default)]
    pub dry_run: bool,
    /// HTTP bridge that performs the actual post for this account
    #[serde(default)]
    pub publish_endpoint: Option<String>,
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// `AUTOPOST_DB_PATH` overrides `database.path`.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let mut config = Self::from_toml_str(&content)?;
        if let Ok(db_path) = std::env::var("AUTOPOST_DB_PATH") {
            config.database.path = db_path;
        }
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the scheduler cannot run safely
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()));
        }

        if self.rate_limit.monthly_cap == 0 {
            return Err(invalid("rate_limit.monthly_cap", "must be at least 1"));
        }
        if let Some(window) = self.rate_limit.posting_window {
            if window.start_hour > 23 || window.end_hour > 24 || window.start_hour == window.end_hour {
                return Err(invalid(
                    "rate_limit.posting_window",
                    "hours must be 0-24 and start must differ from end",
                ));
            }
        }
        if self.health.threshold == 0 {
            return Err(invalid("health.threshold", "must be at least 1"));
        }
        if self.health.window == 0 {
            return Err(invalid("health.window", "must be at least 1 second"));
        }
        if !(0.0..=1.0).contains(&self.dedup.similarity_threshold) {
            return Err(invalid("dedup.similarity_threshold", "must be between 0 and 1"));
        }
        if self.scheduling.dispatch_interval == 0 || self.scheduling.collect_interval == 0 {
            return Err(invalid("scheduling", "intervals must be at least 1 second"));
        }

        let mut niches = HashSet::new();
        for niche in &self.niches {
            if niche.name.trim().is_empty() {
                return Err(invalid("niches.name", "must not be empty"));
            }
            if !niches.insert(niche.name.as_str()) {
                return Err(invalid("niches", &format!("duplicate niche '{}'", niche.name)));
            }
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(invalid("sources.name", "must not be empty"));
            }
            if !niches.contains(source.niche.as_str()) {
                return Err(invalid(
                    "sources.niche",
                    &format!("source '{}' references undeclared niche '{}'", source.name, source.niche),
                ));
            }
            if !seen.insert((source.niche.as_str(), source.name.as_str())) {
                return Err(invalid(
                    "sources",
                    &format!("duplicate source '{}' in niche '{}'", source.name, source.niche),
                ));
            }
            source
                .config
                .validate()
                .map_err(|reason| invalid(&format!("sources.{}", source.name), &reason))?;
        }

        Ok(())
    }

    /// Names of all configured niches, in declaration order
    pub fn niche_names(&self) -> Vec<String> {
        self.niches.iter().map(|n| n.name.clone()).collect()
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Resolve the configuration file path following the XDG Base Directory layout
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("AUTOPOST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("autopost").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AutopostError;
    use crate::types::SourceConfig;
    use serial_test::serial;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[database]
path = "/tmp/autopost.db"

[scheduling]
dispatch_interval = 60
stale_after = 7200

[rate_limit]
min_gap = 1200
monthly_cap = 1500
posting_window = { start_hour = 8, end_hour = 22 }

[[niches]]
name = "rocketleague"

[[niches]]
name = "geometrydash"
dry_run = true

[[sources]]
niche = "rocketleague"
name = "RL Blog"
type = "rss"
url = "https://www.rocketleague.com/rss"

[[sources]]
niche = "geometrydash"
name = "Pointercrate"
type = "api"
collector = "pointercrate"
poll_interval = 300
"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.scheduling.dispatch_interval, 60);
        assert_eq!(config.scheduling.stale_after, 7200);
        // unspecified fields keep their defaults
        assert_eq!(config.scheduling.publish_timeout, 30);
        assert_eq!(config.health.threshold, 10);
        assert_eq!(config.rate_limit.jitter_max, 120);
        assert_eq!(
            config.rate_limit.posting_window,
            Some(PostingWindow {
                start_hour: 8,
                end_hour: 22
            })
        );
        assert_eq!(config.niche_names(), vec!["rocketleague", "geometrydash"]);
        assert!(config.niches[1].dry_run);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[1].poll_interval, Some(300));
        assert!(matches!(config.sources[1].config, SourceConfig::Api { .. }));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml_str("[database]\npath = \"x.db\"\n").unwrap();
        assert_eq!(config.rate_limit, RateLimitConfig::default());
        assert_eq!(config.rate_limit.min_gap, 1200);
        assert_eq!(config.rate_limit.monthly_cap, 1500);
        assert_eq!(config.health.window, 3600);
        assert!(config.niches.is_empty());
    }

    #[test]
    fn test_rejects_source_with_unknown_niche() {
        let text = r#"
[database]
path = "x.db"

[[niches]]
name = "rocketleague"

[[sources]]
niche = "fortnite"
name = "Feed"
type = "rss"
url = "https://example.com/rss"
"#;
        let err = Config::from_toml_str(text).unwrap_err();
        assert!(matches!(err, AutopostError::Config(ConfigError::InvalidValue { .. })));
        assert!(err.to_string().contains("undeclared niche 'fortnite'"));
    }

    #[test]
    fn test_rejects_duplicate_source_names() {
        let text = r#"
[database]
path = "x.db"

[[niches]]
name = "gd"

[[sources]]
niche = "gd"
name = "Feed"
type = "rss"
url = "https://example.com/a"

[[sources]]
niche = "gd"
name = "Feed"
type = "rss"
url = "https://example.com/b"
"#;
        let err = Config::from_toml_str(text).unwrap_err();
        assert!(err.to_string().contains("duplicate source 'Feed'"));
    }

    #[test]
    fn test_rejects_invalid_source_variant_fields() {
        let text = r#"
[database]
path = "x.db"

[[niches]]
name = "gd"

[[sources]]
niche = "gd"
name = "Feed"
type = "rss"
url = "not-a-url"
"#;
        let err = Config::from_toml_str(text).unwrap_err();
        assert!(err.to_string().contains("sources.Feed"));
    }

    #[test]
    fn test_rejects_unknown_source_type() {
        let text = r#"
[database]
path = "x.db"

[[niches]]
name = "gd"

[[sources]]
niche = "gd"
name = "Feed"
type = "carrier_pigeon"
"#;
        let err = Config::from_toml_str(text).unwrap_err();
        assert!(matches!(err, AutopostError::Config(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_rejects_zero_quota_and_threshold() {
        let text = "[database]\npath = \"x.db\"\n[rate_limit]\nmonthly_cap = 0\n";
        assert!(Config::from_toml_str(text).is_err());

        let text = "[database]\npath = \"x.db\"\n[health]\nthreshold = 0\n";
        assert!(Config::from_toml_str(text).is_err());
    }

    #[test]
    fn test_posting_window_contains_hour() {
        let day = PostingWindow {
            start_hour: 8,
            end_hour: 22,
        };
        assert!(day.contains_hour(8));
        assert!(day.contains_hour(21));
        assert!(!day.contains_hour(22));
        assert!(!day.contains_hour(3));

        let night = PostingWindow {
            start_hour: 22,
            end_hour: 6,
        };
        assert!(night.contains_hour(23));
        assert!(night.contains_hour(2));
        assert!(!night.contains_hour(12));
    }

    #[test]
    #[serial]
    fn test_load_from_path_applies_db_override() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        std::env::set_var("AUTOPOST_DB_PATH", "/tmp/override.db");
        let config = Config::load_from_path(&path);
        std::env::remove_var("AUTOPOST_DB_PATH");

        assert_eq!(config.unwrap().database.path, "/tmp/override.db");
    }

    #[test]
    #[serial]
    fn test_resolve_config_path_from_env() {
        std::env::set_var("AUTOPOST_CONFIG", "/etc/autopost/config.toml");
        let path = resolve_config_path().unwrap();
        std::env::remove_var("AUTOPOST_CONFIG");

        assert_eq!(path, PathBuf::from("/etc/autopost/config.toml"));
    }

    #[test]
    fn test_load_missing_file_is_read_error() {
        let err = Config::load_from_path(Path::new("/nonexistent/autopost.toml")).unwrap_err();
        assert!(matches!(err, AutopostError::Config(ConfigError::ReadError(_))));
    }
}
