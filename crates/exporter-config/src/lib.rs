//! # exporter-config
//!
//! Configuration for usage-exporter.
//!
//! Values are resolved in three layers:
//! 1. Built-in defaults
//! 2. An optional YAML file (`--config path.yaml`)
//! 3. Environment variables, which win over both
//!
//! Validation is split per concern so that commands only demand what they use:
//! `list` needs the spool directories, `resend` also needs the delivery API,
//! and `run`/`once` need the upstream console credentials as well.
//!
//! ## Example
//!
//! ```yaml
//! source:
//!   base_url: https://dify.example.com
//!   email: exporter@example.com
//! delivery:
//!   api_url: https://billing.example.com/v1/usage
//!   tenant_id: 6f1c2a4e-58b1-4a57-9a53-0c6b9d0f3e21
//!   max_retries: 3
//! spool:
//!   dir: /var/lib/usage-exporter/spool
//!   max_retry_count: 10
//! schedule:
//!   interval: 1h
//!   shutdown_timeout: 30s
//! export:
//!   aggregation_period: daily
//!   lookback_days: 1
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use exporter_core::{AggregationPeriod, ExporterError, Result};
use serde::Deserialize;
use tracing::debug;

mod duration_str;

/// Environment variable names recognised by [`ExporterConfig::apply_env`].
pub mod env {
    pub const DIFY_API_BASE_URL: &str = "DIFY_API_BASE_URL";
    pub const DIFY_EMAIL: &str = "DIFY_EMAIL";
    pub const DIFY_PASSWORD: &str = "DIFY_PASSWORD";
    pub const EXTERNAL_API_URL: &str = "EXTERNAL_API_URL";
    pub const EXTERNAL_API_TOKEN: &str = "EXTERNAL_API_TOKEN";
    pub const EXTERNAL_API_TENANT_ID: &str = "EXTERNAL_API_TENANT_ID";
    pub const EXTERNAL_API_TIMEOUT_SECS: &str = "EXTERNAL_API_TIMEOUT_SECS";
    pub const EXTERNAL_API_MAX_RETRIES: &str = "EXTERNAL_API_MAX_RETRIES";
    pub const EXPORT_BATCH_SIZE: &str = "EXPORT_BATCH_SIZE";
    pub const SPOOL_DIR: &str = "SPOOL_DIR";
    pub const FAILED_DIR: &str = "FAILED_DIR";
    pub const SPOOL_MAX_RETRY_COUNT: &str = "SPOOL_MAX_RETRY_COUNT";
    pub const EXPORT_INTERVAL: &str = "EXPORT_INTERVAL";
    pub const SHUTDOWN_TIMEOUT: &str = "SHUTDOWN_TIMEOUT";
    pub const AGGREGATION_PERIOD: &str = "AGGREGATION_PERIOD";
    pub const EXPORT_LOOKBACK_DAYS: &str = "EXPORT_LOOKBACK_DAYS";
    pub const NOTIFICATION_WEBHOOK_URL: &str = "NOTIFICATION_WEBHOOK_URL";
    pub const LOG_DIR: &str = "LOG_DIR";
}

/// A credential that never shows up in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw secret value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            write!(f, "Secret(<empty>)")
        } else {
            write!(f, "Secret(****)")
        }
    }
}

/// Top-level exporter configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Upstream Dify console
    pub source: SourceConfig,
    /// Partner billing API
    pub delivery: DeliveryConfig,
    /// Local spool directories
    pub spool: SpoolConfig,
    /// Scheduler timing
    pub schedule: ScheduleConfig,
    /// What to export
    pub export: ExportConfig,
    /// Quarantine notifications
    pub notification: NotificationConfig,
    /// Log output
    pub logging: LoggingConfig,
}

/// Upstream Dify console settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub email: String,
    pub password: Secret,
    pub timeout_secs: u64,
    /// Apps fetched per page when listing
    pub page_size: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            email: String::new(),
            password: Secret::default(),
            timeout_secs: 30,
            page_size: 100,
        }
    }
}

/// Partner billing API settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub api_url: String,
    pub api_token: Secret,
    pub tenant_id: String,
    pub timeout_secs: u64,
    /// In-process retries per send before the batch is spooled
    pub max_retries: u32,
    /// Records per request; larger runs are split into several batches
    pub max_batch_size: usize,
    pub exporter_version: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_token: Secret::default(),
            tenant_id: String::new(),
            timeout_secs: 30,
            max_retries: 3,
            max_batch_size: 500,
            exporter_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Spool directory settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub dir: PathBuf,
    pub failed_dir: PathBuf,
    /// Failed resends before a spooled batch is quarantined
    pub max_retry_count: u32,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        let home = exporter_core::logging::app_home_dir()
            .unwrap_or_else(|_| PathBuf::from(".usage-exporter"));
        Self {
            dir: home.join("spool"),
            failed_dir: home.join("failed"),
            max_retry_count: 10,
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    #[serde(with = "duration_str")]
    pub interval: Duration,
    #[serde(with = "duration_str")]
    pub shutdown_timeout: Duration,
    /// Run an export immediately instead of waiting for the first interval
    pub run_on_startup: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(30),
            run_on_startup: true,
        }
    }
}

/// Export window and granularity.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub aggregation_period: AggregationPeriod,
    /// Whole days before today (UTC) covered by each run
    pub lookback_days: u32,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            aggregation_period: AggregationPeriod::Daily,
            lookback_days: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: Option<PathBuf>,
    pub verbose: bool,
}

impl ExporterConfig {
    /// Load defaults, then the optional YAML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Parse a YAML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExporterError::config_not_found_with_source(path, e)
            } else {
                ExporterError::io("reading config", path, e)
            }
        })?;

        let config = Self::from_yaml_str(&content).map_err(|message| ExporterError::ConfigInvalid {
            path: path.to_path_buf(),
            message,
        })?;
        debug!(path = %path.display(), "loaded configuration file");
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml_str(content: &str) -> std::result::Result<Self, String> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Empty values are treated as unset.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(env::DIFY_API_BASE_URL) {
            self.source.base_url = v;
        }
        if let Some(v) = get(env::DIFY_EMAIL) {
            self.source.email = v;
        }
        if let Some(v) = get(env::DIFY_PASSWORD) {
            self.source.password = Secret::new(v);
        }
        if let Some(v) = get(env::EXTERNAL_API_URL) {
            self.delivery.api_url = v;
        }
        if let Some(v) = get(env::EXTERNAL_API_TOKEN) {
            self.delivery.api_token = Secret::new(v);
        }
        if let Some(v) = get(env::EXTERNAL_API_TENANT_ID) {
            self.delivery.tenant_id = v;
        }
        if let Some(v) = get(env::EXTERNAL_API_TIMEOUT_SECS) {
            self.delivery.timeout_secs = parse_env(env::EXTERNAL_API_TIMEOUT_SECS, &v)?;
        }
        if let Some(v) = get(env::EXTERNAL_API_MAX_RETRIES) {
            self.delivery.max_retries = parse_env(env::EXTERNAL_API_MAX_RETRIES, &v)?;
        }
        if let Some(v) = get(env::EXPORT_BATCH_SIZE) {
            self.delivery.max_batch_size = parse_env(env::EXPORT_BATCH_SIZE, &v)?;
        }
        if let Some(v) = get(env::SPOOL_DIR) {
            self.spool.dir = PathBuf::from(v);
        }
        if let Some(v) = get(env::FAILED_DIR) {
            self.spool.failed_dir = PathBuf::from(v);
        }
        if let Some(v) = get(env::SPOOL_MAX_RETRY_COUNT) {
            self.spool.max_retry_count = parse_env(env::SPOOL_MAX_RETRY_COUNT, &v)?;
        }
        if let Some(v) = get(env::EXPORT_INTERVAL) {
            self.schedule.interval = parse_duration_env(env::EXPORT_INTERVAL, &v)?;
        }
        if let Some(v) = get(env::SHUTDOWN_TIMEOUT) {
            self.schedule.shutdown_timeout = parse_duration_env(env::SHUTDOWN_TIMEOUT, &v)?;
        }
        if let Some(v) = get(env::AGGREGATION_PERIOD) {
            self.export.aggregation_period = v.parse::<AggregationPeriod>().map_err(|message| {
                ExporterError::ConfigEnvInvalid {
                    env_var: env::AGGREGATION_PERIOD.to_string(),
                    message,
                }
            })?;
        }
        if let Some(v) = get(env::EXPORT_LOOKBACK_DAYS) {
            self.export.lookback_days = parse_env(env::EXPORT_LOOKBACK_DAYS, &v)?;
        }
        if let Some(v) = get(env::NOTIFICATION_WEBHOOK_URL) {
            self.notification.webhook_url = Some(v);
        }
        if let Some(v) = get(env::LOG_DIR) {
            self.logging.dir = Some(PathBuf::from(v));
        }

        Ok(())
    }

    /// Requirements for reading and writing the spool.
    pub fn validate_spool(&self) -> Result<()> {
        if self.spool.dir.as_os_str().is_empty() {
            return Err(ExporterError::missing_field("spool.dir", env::SPOOL_DIR));
        }
        if self.spool.failed_dir.as_os_str().is_empty() {
            return Err(ExporterError::missing_field("spool.failed_dir", env::FAILED_DIR));
        }
        if self.spool.dir == self.spool.failed_dir {
            return Err(ExporterError::config_validation(
                "spool.dir and spool.failed_dir must be different directories",
            ));
        }
        if self.spool.max_retry_count == 0 {
            return Err(ExporterError::config_validation(
                "spool.max_retry_count must be at least 1",
            ));
        }
        Ok(())
    }

    /// Requirements for talking to the partner billing API.
    pub fn validate_delivery(&self) -> Result<()> {
        self.validate_spool()?;

        if self.delivery.api_url.trim().is_empty() {
            return Err(ExporterError::missing_field("delivery.api_url", env::EXTERNAL_API_URL));
        }
        validate_http_url("delivery.api_url", &self.delivery.api_url)?;

        if self.delivery.api_token.is_empty() {
            return Err(ExporterError::missing_field(
                "delivery.api_token",
                env::EXTERNAL_API_TOKEN,
            ));
        }
        if self.delivery.tenant_id.trim().is_empty() {
            return Err(ExporterError::missing_field(
                "delivery.tenant_id",
                env::EXTERNAL_API_TENANT_ID,
            ));
        }
        if uuid::Uuid::parse_str(self.delivery.tenant_id.trim()).is_err() {
            return Err(ExporterError::config_validation(format!(
                "delivery.tenant_id must be a UUID, got '{}'",
                self.delivery.tenant_id
            )));
        }
        if self.delivery.max_batch_size == 0 {
            return Err(ExporterError::config_validation(
                "delivery.max_batch_size must be at least 1",
            ));
        }
        if let Some(url) = &self.notification.webhook_url {
            validate_http_url("notification.webhook_url", url)?;
        }
        Ok(())
    }

    /// Requirements for a full export run (upstream fetch plus delivery).
    pub fn validate_source(&self) -> Result<()> {
        self.validate_delivery()?;

        if self.source.base_url.trim().is_empty() {
            return Err(ExporterError::missing_field("source.base_url", env::DIFY_API_BASE_URL));
        }
        validate_http_url("source.base_url", &self.source.base_url)?;

        if self.source.email.trim().is_empty() {
            return Err(ExporterError::missing_field("source.email", env::DIFY_EMAIL));
        }
        if self.source.password.is_empty() {
            return Err(ExporterError::missing_field("source.password", env::DIFY_PASSWORD));
        }
        if self.schedule.interval.is_zero() {
            return Err(ExporterError::config_validation("schedule.interval must be positive"));
        }
        if self.export.lookback_days == 0 {
            return Err(ExporterError::config_validation(
                "export.lookback_days must be at least 1",
            ));
        }
        Ok(())
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ExporterError::ConfigEnvInvalid {
            env_var: name.to_string(),
            message: e.to_string(),
        })
}

fn parse_duration_env(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim()).map_err(|e| ExporterError::ConfigEnvInvalid {
        env_var: name.to_string(),
        message: e.to_string(),
    })
}

fn validate_http_url(field: &str, url: &str) -> Result<()> {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ExporterError::config_validation(format!(
            "{field} must be an http(s) URL, got '{url}'"
        )))
    }
}
