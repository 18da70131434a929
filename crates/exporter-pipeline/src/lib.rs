//! # exporter-pipeline
//!
//! Ties the upstream console to the partner API.
//!
//! - [`source`] - [`UsageSource`] trait and the Dify [`ConsoleClient`]
//! - [`pipeline`] - one export run over an [`ExportWindow`]
//! - [`scheduler`] - fixed-interval runs with graceful shutdown

pub mod error;
pub mod pipeline;
pub mod scheduler;
pub mod source;

pub use error::{PipelineError, SchedulerError, SourceError};
pub use pipeline::{ExportPipeline, ExportWindow, RunSummary};
pub use scheduler::{Scheduler, SchedulerStats};
pub use source::{AppInfo, ConsoleClient, TokenCostQuery, UsageSource};
