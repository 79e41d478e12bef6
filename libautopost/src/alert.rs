//! Operator alerts
//!
//! Delivery is fire-and-forget: [`Alerter::notify`] spawns one task per sink,
//! bounded by a timeout, and returns immediately. A failed or slow sink is
//! logged and otherwise ignored.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::AlertsConfig;
use crate::error::{AutopostError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Error,
    Warning,
    Info,
    Success,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Error => "error",
            AlertLevel::Warning => "warning",
            AlertLevel::Info => "info",
            AlertLevel::Success => "success",
        }
    }

    /// Discord embed colour
    pub fn color(&self) -> u32 {
        match self {
            AlertLevel::Error => 0xE74C3C,
            AlertLevel::Warning => 0xF39C12,
            AlertLevel::Info => 0x3498DB,
            AlertLevel::Success => 0x2ECC71,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub detail: String,
    pub niche: Option<String>,
    pub timestamp: i64,
}

impl Alert {
    pub fn new(level: AlertLevel, title: &str, detail: &str, timestamp: i64) -> Self {
        Self {
            level,
            title: title.to_string(),
            detail: detail.to_string(),
            niche: None,
            timestamp,
        }
    }

    pub fn for_niche(mut self, niche: &str) -> Self {
        self.niche = Some(niche.to_string());
        self
    }

    pub fn publish_failed(niche: &str, entry_id: i64, error: &str, at: i64) -> Self {
        Self::new(
            AlertLevel::Error,
            "Post failed",
            &format!("Queue entry {} failed: {}", entry_id, error),
            at,
        )
        .for_niche(niche)
    }

    pub fn source_disabled(niche: &str, source: &str, recent_errors: u32, at: i64) -> Self {
        Self::new(
            AlertLevel::Warning,
            "Source disabled",
            &format!(
                "{} disabled after {} errors in the health window; re-enable it once fixed",
                source, recent_errors
            ),
            at,
        )
        .for_niche(niche)
    }

    pub fn dry_spell(niche: &str, hours: u64, at: i64) -> Self {
        Self::new(
            AlertLevel::Warning,
            "Dry spell",
            &format!("No successful post in the last {} hours", hours),
            at,
        )
        .for_niche(niche)
    }

    pub fn started(niches: &[String], at: i64) -> Self {
        Self::new(
            AlertLevel::Info,
            "Autopost started",
            &format!("Scheduling niches: {}", niches.join(", ")),
            at,
        )
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the tracing log
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        let niche = alert.niche.as_deref().unwrap_or("-");
        match alert.level {
            AlertLevel::Error => error!(niche, title = %alert.title, "{}", alert.detail),
            AlertLevel::Warning => warn!(niche, title = %alert.title, "{}", alert.detail),
            AlertLevel::Info | AlertLevel::Success => info!(niche, title = %alert.title, "{}", alert.detail),
        }
        Ok(())
    }
}

/// Keeps alerts in memory; for tests
#[derive(Clone, Default)]
pub struct MemoryAlertSink {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }

    /// Poll until at least `count` alerts arrived or a second passed
    pub async fn wait_for(&self, count: usize) -> Vec<Alert> {
        for _ in 0..100 {
            if self.alerts.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.alerts()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Discord webhook with one embed per alert
pub struct DiscordAlertSink {
    webhook_url: String,
    client: reqwest::Client,
}

impl DiscordAlertSink {
    pub fn new(webhook_url: &str) -> Self {
        Self {
            webhook_url: webhook_url.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn payload(alert: &Alert) -> DiscordPayload {
        let title = match &alert.niche {
            Some(niche) => format!("[{}] {}", niche, alert.title),
            None => alert.title.clone(),
        };
        let timestamp = chrono::DateTime::from_timestamp(alert.timestamp, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_default();

        DiscordPayload {
            embeds: vec![DiscordEmbed {
                title,
                description: alert.detail.clone(),
                color: alert.level.color(),
                footer: DiscordFooter {
                    text: format!("{} | {}", alert.level.as_str(), timestamp),
                },
            }],
        }
    }
}

#[async_trait]
impl AlertSink for DiscordAlertSink {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&Self::payload(alert))
            .send()
            .await
            .map_err(|e| AutopostError::Alert(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(AutopostError::Alert(format!("Discord returned {}: {}", status, body)))
        }
    }
}

#[derive(Debug, Serialize)]
struct DiscordPayload {
    embeds: Vec<DiscordEmbed>,
}

#[derive(Debug, Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
    color: u32,
    footer: DiscordFooter,
}

#[derive(Debug, Serialize)]
struct DiscordFooter {
    text: String,
}

/// Fans alerts out to every sink without waiting for delivery
#[derive(Clone)]
pub struct Alerter {
    sinks: Vec<Arc<dyn AlertSink>>,
    timeout: Duration,
}

impl Alerter {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>, timeout: Duration) -> Self {
        Self { sinks, timeout }
    }

    /// Discord when a webhook is configured, the log otherwise
    pub fn from_config(config: &AlertsConfig) -> Self {
        let sink: Arc<dyn AlertSink> = match &config.discord_webhook {
            Some(url) if !url.trim().is_empty() => Arc::new(DiscordAlertSink::new(url)),
            _ => Arc::new(LogAlertSink),
        };
        Self::new(vec![sink], Duration::from_secs(config.timeout))
    }

    pub fn disabled() -> Self {
        Self::new(Vec::new(), Duration::from_secs(0))
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Spawn delivery and return immediately
    pub fn notify(&self, alert: Alert) {
        if self.sinks.is_empty() {
            return;
        }

        let alert = Arc::new(alert);
        for sink in &self.sinks {
            let sink = Arc::clone(sink);
            let alert = Arc::clone(&alert);
            let timeout = self.timeout;

            tokio::spawn(async move {
                match tokio::time::timeout(timeout, sink.notify(&alert)).await {
                    Ok(Ok(())) => debug!(sink = sink.name(), title = %alert.title, "alert sent"),
                    Ok(Err(e)) => warn!(sink = sink.name(), error = %e, "alert delivery failed"),
                    Err(_) => warn!(sink = sink.name(), timeout_secs = timeout.as_secs(), "alert delivery timed out"),
                }
            });
        }
    }

    /// Deliver to every sink concurrently and collect the results
    pub async fn notify_and_wait(&self, alert: &Alert) -> Vec<(&'static str, Result<()>)> {
        let deliveries = self.sinks.iter().map(|sink| async move {
            let result = match tokio::time::timeout(self.timeout, sink.notify(alert)).await {
                Ok(result) => result,
                Err(_) => Err(AutopostError::Alert(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                ))),
            };
            (sink.name(), result)
        });
        futures::future::join_all(deliveries).await
    }
}
