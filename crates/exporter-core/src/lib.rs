//! # exporter-core
//!
//! Core types, errors, and utilities shared by the usage-exporter crates.
//!
//! This crate provides:
//! - [`ExporterError`] - Error type for configuration, I/O and startup failures
//! - [`logging`] - Tracing setup and structured logging macros
//! - [`types`] - Shared type definitions (timestamps, aggregation period)
//! - [`recovery`] - Exponential backoff configuration and retry helpers
//!
//! ## Example
//!
//! ```no_run
//! use exporter_core::{ExporterError, logging};
//!
//! fn main() -> exporter_core::Result<()> {
//!     let _guard = logging::init_logging(None, false)?;
//!
//!     let config_path = std::path::Path::new("/etc/usage-exporter/config.yaml");
//!     if !config_path.exists() {
//!         return Err(ExporterError::config_not_found(config_path));
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod recovery;
pub mod types;

// Re-export main types for convenience
pub use error::{ExporterError, Result};
pub use logging::{LogGuard, init_logging};
pub use recovery::RetryConfig;
pub use types::{AggregationPeriod, Timestamp};
