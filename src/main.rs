//! usage-exporter - Dify usage export to a partner billing API
//!
//! Collects per-model token usage and cost from a Dify console, aggregates it
//! per period and delivers it to the partner API. Undeliverable batches are
//! spooled to disk and retried; batches that exhaust their retries are moved
//! to a failed directory for manual resend.
//!
//! ## Usage
//!
//! ```bash
//! # Export every hour until SIGINT/SIGTERM
//! usage-exporter run
//!
//! # One export over the last 7 days
//! usage-exporter once --days 7
//!
//! # Inspect and resend quarantined batches
//! usage-exporter list --json
//! usage-exporter resend --file spool_20251201T000000000Z_abcd.json
//! usage-exporter resend --all
//!
//! # Verbose logging, custom config and log directory
//! usage-exporter -v --config /etc/usage-exporter.yaml --log-dir /var/log/usage-exporter run
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use exporter_config::ExporterConfig;
use exporter_core::{ExporterError, LogGuard, init_logging, types};
use exporter_delivery::{ExternalApiSender, SendOutcome, SpoolManager};
use exporter_pipeline::{ExportPipeline, ExportWindow, PipelineError, Scheduler, SchedulerError};
use serde::Serialize;
use tracing::{error, info, warn};

/// How long a command waits for quarantine notifications before exiting.
const NOTIFICATION_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Export Dify model usage and cost to a partner billing API
#[derive(Parser, Debug)]
#[command(name = "usage-exporter")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging (increases log level)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Directory for log files (defaults to ~/.usage-exporter/logs/)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// YAML configuration file; environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export on a fixed interval until interrupted
    Run,

    /// Run a single export and exit
    Once {
        /// Whole UTC days before today to export (defaults to the configured lookback)
        #[arg(long)]
        days: Option<u32>,
    },

    /// List batches in the failed directory
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Resend batches from the failed directory
    Resend(ResendArgs),
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct ResendArgs {
    /// Name of one failed file
    #[arg(long)]
    file: Option<String>,

    /// Every failed file
    #[arg(long)]
    all: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ExporterConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            report_config_error(&e);
            return ExitCode::from(1);
        }
    };

    let _guard = match setup_logging(&cli, &config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            return ExitCode::from(1);
        }
    };

    let result = match cli.command {
        Command::Run => run_scheduler(&config).await,
        Command::Once { days } => run_once(&config, days).await,
        Command::List { json } => list_failed(&config, json).await,
        Command::Resend(args) => resend(&config, args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "command failed");
            match config_error(&e) {
                Some(config_err) => report_config_error(config_err),
                None => eprintln!("Error: {e:#}"),
            }
            ExitCode::from(1)
        }
    }
}

/// The configuration error behind a command failure, if that is what it was.
fn config_error(err: &anyhow::Error) -> Option<&ExporterError> {
    err.downcast_ref::<ExporterError>()
        .or_else(|| match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::Config(inner)) => Some(inner),
            _ => None,
        })
}

fn report_config_error(err: &ExporterError) {
    eprintln!("Error: {err}");
    if let Some(hint) = err.guidance() {
        eprintln!("Hint: {hint}");
    }
}

/// Set up logging from CLI flags, falling back to the configuration.
fn setup_logging(cli: &Cli, config: &ExporterConfig) -> exporter_core::Result<LogGuard> {
    let log_dir = cli.log_dir.clone().or_else(|| config.logging.dir.clone());
    let debug = cli.verbose > 0 || config.logging.verbose;
    init_logging(log_dir, debug)
}

async fn run_scheduler(config: &ExporterConfig) -> anyhow::Result<ExitCode> {
    let pipeline = Arc::new(ExportPipeline::from_config(config)?);
    let scheduler = Scheduler::from_config(&config.schedule);
    let lookback = config.export.lookback_days;

    info!(
        tenant_id = %config.delivery.tenant_id,
        period = %pipeline.period(),
        lookback_days = lookback,
        "starting usage exporter"
    );

    let spool = pipeline.sender().spool().clone();
    let job = move || {
        let pipeline = Arc::clone(&pipeline);
        async move {
            let window = ExportWindow::trailing_days(lookback, types::now());
            if let Err(e) = pipeline.run_once(window).await {
                error!(window = %window, error = %e, "export run failed");
            }
        }
    };

    match scheduler.run(job, shutdown_signal()).await {
        Ok(stats) => {
            spool.flush_notifications(NOTIFICATION_FLUSH_TIMEOUT).await;
            info!(runs = stats.runs_started, "usage exporter stopped");
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ SchedulerError::ShutdownTimeout { .. }) => {
            spool.flush_notifications(NOTIFICATION_FLUSH_TIMEOUT).await;
            error!(error = %e, "forcing exit");
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_once(config: &ExporterConfig, days: Option<u32>) -> anyhow::Result<ExitCode> {
    let days = days.unwrap_or(config.export.lookback_days);
    anyhow::ensure!(days >= 1, "--days must be at least 1");

    let pipeline = ExportPipeline::from_config(config)?;
    let window = ExportWindow::trailing_days(days, types::now());
    let result = pipeline.run_once(window).await;
    pipeline
        .sender()
        .spool()
        .flush_notifications(NOTIFICATION_FLUSH_TIMEOUT)
        .await;
    let summary = result.with_context(|| format!("export run over {window} failed"))?;

    println!(
        "Exported {window}: {} record(s) in {} batch(es); delivered {}, already recorded {}, spooled {}, rejected {}",
        summary.records,
        summary.batches,
        summary.delivered,
        summary.already_recorded,
        summary.spooled,
        summary.rejected,
    );
    if summary.apps_failed > 0 {
        println!("Skipped {} app(s) that could not be read", summary.apps_failed);
    }
    if summary.resend.total > 0 {
        println!(
            "Spool: {} resent, {} retained, {} moved to failed",
            summary.resend.delivered, summary.resend.retained, summary.resend.quarantined
        );
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FailedFileRow {
    file_name: String,
    batch_idempotency_key: String,
    record_count: usize,
    first_attempt: String,
    retry_count: u32,
    last_error: String,
}

async fn list_failed(config: &ExporterConfig, json: bool) -> anyhow::Result<ExitCode> {
    config.validate_spool()?;
    let spool = SpoolManager::new(&config.spool.dir, &config.spool.failed_dir);
    let rows: Vec<FailedFileRow> = spool
        .list_failed_files()
        .await
        .context("failed to read the failed directory")?
        .into_iter()
        .map(|entry| FailedFileRow {
            record_count: entry.file.record_count(),
            file_name: entry.file_name,
            batch_idempotency_key: entry.file.batch_idempotency_key,
            first_attempt: entry.file.first_attempt,
            retry_count: entry.file.retry_count,
            last_error: entry.file.last_error,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(ExitCode::SUCCESS);
    }

    if rows.is_empty() {
        println!("No failed batches in {}", config.spool.failed_dir.display());
        return Ok(ExitCode::SUCCESS);
    }
    for row in &rows {
        println!(
            "{}  records={}  first_attempt={}  retries={}  last_error={}",
            row.file_name, row.record_count, row.first_attempt, row.retry_count, row.last_error
        );
    }
    println!("{} failed batch(es)", rows.len());
    Ok(ExitCode::SUCCESS)
}

fn describe(outcome: &SendOutcome) -> String {
    match outcome {
        SendOutcome::Delivered { attempts } => format!("delivered after {attempts} attempt(s)"),
        SendOutcome::AlreadyRecorded { attempts } => {
            format!("already recorded (409) after {attempts} attempt(s)")
        }
        SendOutcome::Spooled { path, .. } => format!("spooled to {}", path.display()),
    }
}

async fn resend(config: &ExporterConfig, args: ResendArgs) -> anyhow::Result<ExitCode> {
    config.validate_delivery()?;
    let sender = ExternalApiSender::from_exporter_config(config)?;

    if let Some(name) = args.file {
        let result = sender.resend_failed_file(&name).await;
        sender.spool().flush_notifications(NOTIFICATION_FLUSH_TIMEOUT).await;
        let outcome = result.with_context(|| format!("resend of {name} failed"))?;
        println!("{name}: {}", describe(&outcome));
        return Ok(ExitCode::SUCCESS);
    }

    let results = sender.resend_all_failed().await;
    sender.spool().flush_notifications(NOTIFICATION_FLUSH_TIMEOUT).await;
    let results = results?;
    let mut succeeded = 0;
    for resend in &results {
        match &resend.result {
            Ok(outcome) => {
                succeeded += 1;
                println!(
                    "{} ({} records): {}",
                    resend.file_name,
                    resend.record_count,
                    describe(outcome)
                );
            }
            Err(e) => {
                warn!(file = %resend.file_name, error = %e, "resend failed");
                println!("{} ({} records): FAILED {e}", resend.file_name, resend.record_count);
            }
        }
    }
    println!(
        "Resent {succeeded} of {} failed batch(es); {} left in {}",
        results.len(),
        results.len() - succeeded,
        config.spool.failed_dir.display()
    );
    Ok(ExitCode::SUCCESS)
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_resend_requires_exactly_one_target() {
        assert!(Cli::try_parse_from(["usage-exporter", "resend"]).is_err());
        assert!(Cli::try_parse_from(["usage-exporter", "resend", "--all", "--file", "x"]).is_err());

        let cli = Cli::try_parse_from(["usage-exporter", "resend", "--file", "x.json"]).unwrap();
        match cli.command {
            Command::Resend(args) => assert_eq!(args.file.as_deref(), Some("x.json")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["usage-exporter", "once", "--days", "7", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Command::Once { days: Some(7) }));
    }
}
