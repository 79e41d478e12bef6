//! autopost-queue - Inspect the publish queue, post ledger and sources
//!
//! Read-mostly operator tool. It never changes queue entry status; the only
//! writes are seeding sources from configuration and re-enabling a source.

use clap::{Parser, Subcommand};
use libautopost::logging::{LogFormat, LoggingConfig};
use libautopost::queue::QueueStats;
use libautopost::{
    AutopostError, Config, Database, HealthTracker, PostLogRecord, PublishQueue, QueueEntry, QueueStatus,
    RateLimiter, Result, Source,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "autopost-queue")]
#[command(version)]
#[command(about = "Inspect the publish queue, post ledger and sources")]
#[command(long_about = "\
autopost-queue - Inspect the publish queue, post ledger and sources

DESCRIPTION:
    autopost-queue reads the Autopost database. Queue entries are never
    modified from here: publishing, failing and skipping belong to the
    autopost-send daemon.

COMMANDS:
    list           List queue entries in dispatch order
    stats          Per-niche queue counts and monthly quota usage
    history        Recent publish attempts from the post ledger
    sources        Configured sources and their health
    errors         Error history of one source
    enable-source  Re-enable a source disabled after repeated failures
    seed           Insert sources declared in the config file

USAGE EXAMPLES:
    # What will be posted next
    autopost-queue list --niche rocketleague

    # Failed posts as JSON
    autopost-queue list --status failed --format json

    # Quota usage this month
    autopost-queue stats

    # Bring a source back after fixing its feed
    autopost-queue enable-source 4

CONFIGURATION:
    Configuration file: ~/.config/autopost/config.toml

    Override with environment variables:
        AUTOPOST_CONFIG    - Path to config file
        AUTOPOST_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database or configuration error
    3 - Invalid input (bad source ID, status, format, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(long, global = true, env = "AUTOPOST_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    #[arg(help = "Enable verbose logging to stderr (useful for debugging)")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List queue entries in dispatch order
    List {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Filter by niche
        #[arg(short, long)]
        niche: Option<String>,

        /// Filter by status: queued, posted, failed or skipped
        #[arg(short, long, default_value = "queued")]
        status: String,

        /// Maximum number of entries
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Per-niche queue counts and monthly quota usage
    Stats {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Recent publish attempts, newest first
    History {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Filter by niche
        #[arg(short, long)]
        niche: Option<String>,

        /// Maximum number of attempts
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Sources and their health
    Sources {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Filter by niche
        #[arg(short, long)]
        niche: Option<String>,
    },

    /// Error history of one source
    Errors {
        /// Source ID
        source_id: i64,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Maximum number of errors
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Re-enable a disabled source
    EnableSource {
        /// Source ID
        source_id: i64,
    },

    /// Insert sources declared in the config file
    Seed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

fn parse_format(format: &str) -> Result<OutputFormat> {
    match format {
        "text" => Ok(OutputFormat::Text),
        "json" => Ok(OutputFormat::Json),
        other => Err(AutopostError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            other
        ))),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::new(LogFormat::Text, "error".to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    let db = Database::new(&config.database.path).await?;
    let now = chrono::Utc::now().timestamp();
    debug!(db = %config.database.path, command = ?cli.command, "running");

    match cli.command {
        Commands::List {
            format,
            niche,
            status,
            limit,
        } => {
            let format = parse_format(&format)?;
            let status: QueueStatus = status.parse().map_err(AutopostError::InvalidInput)?;
            cmd_list(&db, format, niche.as_deref(), status, limit, now).await
        }
        Commands::Stats { format } => cmd_stats(&db, &config, parse_format(&format)?, now).await,
        Commands::History { format, niche, limit } => {
            cmd_history(&db, parse_format(&format)?, niche.as_deref(), limit).await
        }
        Commands::Sources { format, niche } => {
            cmd_sources(&db, &config, parse_format(&format)?, niche.as_deref(), now).await
        }
        Commands::Errors {
            source_id,
            format,
            limit,
        } => cmd_errors(&db, &config, parse_format(&format)?, source_id, limit).await,
        Commands::EnableSource { source_id } => cmd_enable_source(&db, &config, source_id, now).await,
        Commands::Seed => cmd_seed(&db, &config, now).await,
    }
}

/// List queue entries in the order the dispatcher would take them
async fn cmd_list(
    db: &Database,
    format: OutputFormat,
    niche: Option<&str>,
    status: QueueStatus,
    limit: usize,
    now: i64,
) -> Result<()> {
    let entries = PublishQueue::default().list(db, niche, Some(status), limit).await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::to_value(&entries).unwrap_or_default()),
        OutputFormat::Text => output_entries_text(&entries, now),
    }
    Ok(())
}

fn output_entries_text(entries: &[QueueEntry], now: i64) {
    for entry in entries {
        let marker = if entry.is_breaking() { "!" } else { " " };
        println!(
            "{}{} | {} | p{} | {} | {} | {}",
            marker,
            entry.id,
            entry.niche,
            entry.priority,
            entry.status,
            format_age(now, entry.created_at),
            truncate_content(&entry.text, 50)
        );
    }
}

/// Queue counts plus quota usage for every configured niche
async fn cmd_stats(db: &Database, config: &Config, format: OutputFormat, now: i64) -> Result<()> {
    let queue = PublishQueue::new(config.scheduling.stale_after);
    let limiter = RateLimiter::from_config(&config.rate_limit);
    let stats = queue.stats(db, None).await?;

    let mut rows = Vec::new();
    for niche in config.niche_names() {
        let counts = stats.iter().find(|s| s.niche == niche).cloned().unwrap_or_else(|| QueueStats {
            niche: niche.clone(),
            ..QueueStats::default()
        });
        let month = limiter.monthly_count(db, &niche, now).await?;
        let next_slot = db
            .last_successful_post(&niche)
            .await?
            .map(|last| limiter.next_slot(&niche, last));
        rows.push((counts, month, next_slot));
    }

    match format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = rows
                .iter()
                .map(|(s, month, next_slot)| {
                    serde_json::json!({
                        "niche": s.niche,
                        "queued": s.queued,
                        "posted": s.posted,
                        "failed": s.failed,
                        "skipped": s.skipped,
                        "oldest_queued": s.oldest_queued,
                        "posted_this_month": month,
                        "monthly_cap": limiter.monthly_cap(),
                        "next_slot": next_slot,
                    })
                })
                .collect();
            print_json(&serde_json::Value::Array(json));
        }
        OutputFormat::Text => {
            for (s, month, next_slot) in &rows {
                let oldest = s
                    .oldest_queued
                    .map(|t| format!(", oldest {}", format_age(now, t)))
                    .unwrap_or_default();
                let slot = match next_slot {
                    Some(slot) if *slot > now => format!("next slot in {}", format_span(slot - now)),
                    _ => "ready".to_string(),
                };
                println!(
                    "{}: {} queued, {} posted, {} failed, {} skipped{} | {}/{} this month | {}",
                    s.niche,
                    s.queued,
                    s.posted,
                    s.failed,
                    s.skipped,
                    oldest,
                    month,
                    limiter.monthly_cap(),
                    slot
                );
            }
        }
    }
    Ok(())
}

/// Recent ledger rows
async fn cmd_history(db: &Database, format: OutputFormat, niche: Option<&str>, limit: usize) -> Result<()> {
    let history = db.post_history(niche, limit).await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::to_value(&history).unwrap_or_default()),
        OutputFormat::Text => output_history_text(&history),
    }
    Ok(())
}

fn output_history_text(history: &[PostLogRecord]) {
    use chrono::{TimeZone, Utc};

    for record in history {
        let when = Utc
            .timestamp_opt(record.posted_at, 0)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| record.posted_at.to_string());
        let result = match (&record.external_post_id, &record.error) {
            (Some(post_id), _) => format!("posted {}", post_id),
            (None, Some(error)) => format!("failed: {}", error),
            (None, None) => "failed".to_string(),
        };
        println!(
            "{} | {} | #{} | {} | {}",
            when,
            record.niche,
            record.queue_entry_id,
            truncate_content(&record.text, 40),
            result
        );
    }
}

/// Sources with their current error count
async fn cmd_sources(
    db: &Database,
    config: &Config,
    format: OutputFormat,
    niche: Option<&str>,
    now: i64,
) -> Result<()> {
    let health = HealthTracker::from_config(&config.health);
    let sources = db.list_sources(niche, false).await?;

    let mut rows: Vec<(Source, u32)> = Vec::with_capacity(sources.len());
    for source in sources {
        let errors = health.recent_errors(db, source.id, now).await?;
        rows.push((source, errors));
    }

    match format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = rows
                .iter()
                .map(|(source, errors)| {
                    serde_json::json!({
                        "id": source.id,
                        "niche": source.niche,
                        "name": source.name,
                        "kind": source.config.kind(),
                        "enabled": source.enabled,
                        "disabled_at": source.disabled_at,
                        "recent_errors": errors,
                    })
                })
                .collect();
            print_json(&serde_json::Value::Array(json));
        }
        OutputFormat::Text => {
            for (source, errors) in &rows {
                let state = match source.disabled_at {
                    _ if source.enabled => "enabled".to_string(),
                    Some(at) => format!("DISABLED {}", format_age(now, at)),
                    None => "DISABLED".to_string(),
                };
                println!(
                    "{} | {} | {} | {} | {} | {}/{} errors",
                    source.id,
                    source.niche,
                    source.name,
                    source.config.kind(),
                    state,
                    errors,
                    config.health.threshold
                );
            }
        }
    }
    Ok(())
}

async fn cmd_errors(db: &Database, config: &Config, format: OutputFormat, source_id: i64, limit: usize) -> Result<()> {
    let health = HealthTracker::from_config(&config.health);
    // InvalidInput for an unknown id
    health.is_enabled(db, source_id).await?;
    let events = health.error_history(db, source_id, limit).await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::to_value(&events).unwrap_or_default()),
        OutputFormat::Text => {
            for event in &events {
                println!("{} | {}", event.occurred_at, event.detail);
            }
        }
    }
    Ok(())
}

async fn cmd_enable_source(db: &Database, config: &Config, source_id: i64, now: i64) -> Result<()> {
    let health = HealthTracker::from_config(&config.health);
    if health.enable(db, source_id, now).await? {
        println!("Source {} enabled", source_id);
    } else {
        println!("Source {} is already enabled", source_id);
    }
    Ok(())
}

async fn cmd_seed(db: &Database, config: &Config, now: i64) -> Result<()> {
    let ids = db.seed_sources(&config.sources, now).await?;
    for (source, id) in config.sources.iter().zip(ids) {
        println!("{} | {} | {}", id, source.niche, source.name);
    }
    Ok(())
}

fn print_json(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

/// Truncate content to max length (in characters) with ellipsis
fn truncate_content(content: &str, max_len: usize) -> String {
    let single_line = content.replace('\n', " ");
    if single_line.chars().count() <= max_len {
        single_line
    } else {
        let cut: String = single_line.chars().take(max_len).collect();
        format!("{}...", cut)
    }
}

/// Minute-resolution span such as "2h 5m"
fn format_span(secs: i64) -> String {
    if secs < 60 {
        return "<1m".to_string();
    }
    let rounded = (secs / 60 * 60) as u64;
    humantime::format_duration(Duration::from_secs(rounded)).to_string()
}

fn format_age(now: i64, at: i64) -> String {
    let diff = now - at;
    if diff < 0 {
        return "in the future".to_string();
    }
    format!("{} ago", format_span(diff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(parse_format("text").unwrap(), OutputFormat::Text);
        assert_eq!(parse_format("json").unwrap(), OutputFormat::Json);
        assert!(matches!(parse_format("yaml"), Err(AutopostError::InvalidInput(_))));
    }

    #[test]
    fn test_truncate_content() {
        assert_eq!(truncate_content("short", 10), "short");
        assert_eq!(truncate_content("line one\nline two", 8), "line one...");
        assert_eq!(truncate_content("ééééé", 3), "ééé...");
    }

    #[test]
    fn test_format_span() {
        assert_eq!(format_span(30), "<1m");
        assert_eq!(format_span(90), "1m");
        assert_eq!(format_span(2 * 3600 + 5 * 60 + 12), "2h 5m");
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(1000, 1000 - 3600), "1h ago");
        assert_eq!(format_age(1000, 2000), "in the future");
    }
}
