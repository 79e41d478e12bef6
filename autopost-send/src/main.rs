//! autopost-send - Collection and publishing daemon
//!
//! Seeds the configured sources, then runs the scheduler: collection per
//! source, dispatch per niche, staleness sweeps and dry-spell checks.

use clap::Parser;
use libautopost::alert::{Alert, Alerter};
use libautopost::collector::CollectorRegistry;
use libautopost::formatter::PlainFormatter;
use libautopost::logging::{LogFormat, LoggingConfig};
use libautopost::publisher::{self, Publisher};
use libautopost::scheduler::RoundReport;
use libautopost::{AutopostError, Config, Database, Result, Scheduler, TickOutcome};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "autopost-send")]
#[command(version)]
#[command(about = "Collect, queue and publish posts on schedule")]
#[command(long_about = "\
autopost-send - Collection and publishing daemon

DESCRIPTION:
    autopost-send is a long-running daemon. It collects new items from the
    configured sources, queues them by priority and publishes them per niche
    within the posting limits:

        - at least rate_limit.min_gap seconds (plus jitter) between posts
        - at most rate_limit.monthly_cap successful posts per calendar month
        - breaking items skip the gap but never the monthly cap

    Every attempt is recorded in the post ledger. Failed posts are alerted
    and not retried. Sources that keep failing are disabled until
    re-enabled with `autopost-queue enable-source`.

USAGE:
    # Run in foreground (logs to stderr)
    autopost-send

    # Log posts instead of publishing them
    autopost-send --dry-run

    # JSON logs for a log shipper
    autopost-send --log-format json

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current round)

CONFIGURATION:
    Configuration file: ~/.config/autopost/config.toml

    Override with environment variables:
        AUTOPOST_CONFIG      - Path to config file
        AUTOPOST_DB_PATH     - Path to database file
        AUTOPOST_LOG_FORMAT  - text, json or pretty
        AUTOPOST_LOG_LEVEL   - Log level (RUST_LOG takes precedence)

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error (including loss of the database)
    2 - Configuration error
")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, env = "AUTOPOST_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log posts instead of publishing them, for every niche
    #[arg(long)]
    dry_run: bool,

    /// Log output format: text, json or pretty
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,

    /// Run one full round and exit (for testing)
    #[arg(long, hide = true)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

fn init_logging(cli: &Cli) {
    let mut logging = LoggingConfig::from_env(cli.verbose);
    if let Some(format) = cli.log_format {
        logging.format = format;
    }
    logging.init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    if config.niches.is_empty() {
        return Err(libautopost::error::ConfigError::MissingField("niches".to_string()).into());
    }

    let db = Database::new(&config.database.path).await?;
    let now = chrono::Utc::now().timestamp();
    let seeded = db.seed_sources(&config.sources, now).await?;
    info!(sources = seeded.len(), "sources seeded");

    let publish_timeout = Duration::from_secs(config.scheduling.publish_timeout);
    let mut publishers: Vec<(String, Arc<dyn Publisher>)> = Vec::new();
    for niche in &config.niches {
        let publisher = publisher::for_niche(niche, cli.dry_run, publish_timeout)?;
        info!(niche = %niche.name, publisher = publisher.name(), "niche ready");
        publishers.push((niche.name.clone(), publisher));
    }

    let alerter = Alerter::from_config(&config.alerts);
    let registry = CollectorRegistry::with_defaults(Duration::from_secs(config.scheduling.collect_timeout));
    let mut scheduler = Scheduler::from_config(
        &config,
        db,
        publishers,
        Arc::new(PlainFormatter::default()),
        registry,
        alerter.clone(),
        now,
    );

    if cli.once {
        let report = scheduler.run_once(now).await?;
        print_summary(&report);
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    info!("autopost-send daemon starting");
    alerter.notify(Alert::started(&scheduler.niches(), now));
    scheduler.run(shutdown).await?;
    info!("autopost-send daemon stopped");
    Ok(())
}

/// One line per round on stdout, for `--once`
fn print_summary(report: &RoundReport) {
    let enqueued: usize = report.collections.iter().map(|c| c.enqueued).sum();
    let duplicates: usize = report.collections.iter().map(|c| c.duplicates).sum();
    let count = |f: fn(&TickOutcome) -> bool| report.dispatches.iter().filter(|(_, o)| f(o)).count();

    println!(
        "{}",
        serde_json::json!({
            "enqueued": enqueued,
            "duplicates": duplicates,
            "posted": count(|o| matches!(o, TickOutcome::Posted { .. })),
            "deferred": count(|o| matches!(o, TickOutcome::Deferred { .. })),
            "failed": count(|o| matches!(o, TickOutcome::Failed { .. })),
            "stale_skipped": report.stale_skipped,
            "recovered": report.recovered.len(),
        })
    );
}

#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| AutopostError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            info!("Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::SeqCst);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::SeqCst);
        }
    });
    Ok(())
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
    fn test_log_format_flag_parses() {
        let cli = Cli::try_parse_from(["autopost-send", "--log-format", "json", "--once"]).unwrap();
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        assert!(cli.once);

        assert!(Cli::try_parse_from(["autopost-send", "--log-format", "xml"]).is_err());
    }
}
