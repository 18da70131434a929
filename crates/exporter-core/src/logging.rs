//! Logging infrastructure for usage-exporter.
//!
//! Structured logging via the `tracing` ecosystem.
//!
//! ## Features
//!
//! - JSON lines format for machine parsing
//! - Daily-rolling file output to `~/.usage-exporter/logs/usage-exporter.log`
//! - Console output with configurable verbosity
//!
//! ## Example
//!
//! ```no_run
//! use exporter_core::logging;
//!
//! let _guard = logging::init_logging(None, false).expect("logging init");
//!
//! tracing::info!("exporter started");
//! tracing::debug!(batch_key = "3fa9...", "sending batch");
//! ```

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{ExporterError, Result};

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "usage-exporter.log";

/// Guard that must be held to ensure log flushing on shutdown.
///
/// When this guard is dropped, it flushes any pending log entries.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize the logging system.
///
/// This sets up:
/// - File logging to `<log_dir>/usage-exporter.log` (JSON lines format)
/// - Console logging to stderr (human-readable format)
///
/// `RUST_LOG` overrides the level; otherwise `verbose` selects DEBUG over INFO
/// for the exporter crates.
pub fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> Result<LogGuard> {
    let log_dir = match log_dir {
        Some(dir) => dir,
        None => default_log_dir()?,
    };

    std::fs::create_dir_all(&log_dir).map_err(|e| ExporterError::DirectoryCreation {
        path: log_dir.clone(),
        source: e,
    })?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(default_level)));

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_span_list(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(verbose)
        .with_line_number(verbose)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    tracing::debug!(log_dir = %log_dir.display(), verbose, "logging initialized");

    Ok(LogGuard {
        _file_guard: Some(file_guard),
    })
}

/// Filter directives enabling `level` for every exporter crate.
pub fn default_filter(level: &str) -> String {
    [
        "usage_exporter",
        "exporter_core",
        "exporter_config",
        "exporter_transform",
        "exporter_delivery",
        "exporter_pipeline",
    ]
    .iter()
    .map(|target| format!("{target}={level}"))
    .collect::<Vec<_>>()
    .join(",")
}

/// Initialize minimal console-only logging for testing.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// Application home directory: `~/.usage-exporter/`.
pub fn app_home_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| ExporterError::Internal {
        message: "home directory could not be determined".into(),
    })?;

    Ok(home.join(".usage-exporter"))
}

/// Get the default log directory path.
///
/// Returns `~/.usage-exporter/logs/`
pub fn default_log_dir() -> Result<PathBuf> {
    Ok(app_home_dir()?.join("logs"))
}

/// Convenience macro for logging batch delivery events.
///
/// # Example
///
/// ```ignore
/// log_delivery_event!(batch_key, "delivered", records = 12);
/// log_delivery_event!(batch_key, "spooled", error = %err);
/// ```
#[macro_export]
macro_rules! log_delivery_event {
    ($batch_key:expr, $event:expr) => {
        tracing::info!(
            target: "exporter::delivery",
            batch_key = %$batch_key,
            event = $event,
            "delivery event"
        )
    };
    ($batch_key:expr, $event:expr, $($field:tt)*) => {
        tracing::info!(
            target: "exporter::delivery",
            batch_key = %$batch_key,
            event = $event,
            $($field)*,
            "delivery event"
        )
    };
}

/// Convenience macro for logging spool transitions.
///
/// # Example
///
/// ```ignore
/// log_spool_event!("quarantined", file = %name, retry_count = 10);
/// ```
#[macro_export]
macro_rules! log_spool_event {
    ($event:expr, $($field:tt)*) => {
        tracing::info!(
            target: "exporter::spool",
            event = $event,
            $($field)*,
            "spool event"
        )
    };
}
