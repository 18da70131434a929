//! # exporter-transform
//!
//! Turns upstream usage rows into validated partner API requests.
//!
//! Stages, in order:
//! - [`aggregator`] - fold raw daily rows into per-period records
//! - [`normalizer`] - canonical provider/model names, numeric cost
//! - [`transformer`] - wire records, date range, schema validation
//! - [`idempotency`] - deterministic record, batch and event ids
//!
//! ## Example
//!
//! ```no_run
//! use exporter_core::AggregationPeriod;
//! use exporter_transform::{AggregatedModelRecord, BatchContext, Normalizer, Transformer};
//!
//! let record = AggregatedModelRecord::new("2025-12-01", "app-1", "aws-bedrock", "claude-3-5-sonnet")
//!     .with_tokens(10_000, 5_000, 15_000)
//!     .with_total_price("0.018");
//!
//! let normalized = Normalizer::new().normalize(&[record]);
//! let transformer = Transformer::new(BatchContext::new(
//!     "6f1c2a4e-58b1-4a57-9a53-0c6b9d0f3e21",
//!     "0.3.0",
//!     AggregationPeriod::Daily,
//! ));
//! let batch = transformer.transform(&normalized).expect("valid batch");
//! assert_eq!(batch.request.records[0].provider, "aws");
//! ```

pub mod aggregator;
pub mod error;
pub mod idempotency;
pub mod models;
pub mod normalizer;
pub mod transformer;
pub mod wire;

pub use aggregator::PeriodAggregator;
pub use error::TransformError;
pub use models::{AggregatedModelRecord, AppTokenCostRow, ExportBatch, NormalizedModelRecord};
pub use normalizer::Normalizer;
pub use transformer::{BatchContext, Transformer};
pub use wire::{UsageExportRequest, UsageWireRecord};
