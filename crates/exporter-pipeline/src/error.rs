//! Error types for the upstream source, the pipeline and the scheduler.

use std::time::Duration;

use exporter_core::ExporterError;
use exporter_delivery::DeliveryError;
use exporter_transform::TransformError;
use thiserror::Error;

/// Upstream console errors.
#[derive(Debug, Error)]
pub enum SourceError {
    /// No response was received
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    /// Non-2xx response other than an expired session
    #[error("console returned HTTP {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    /// Login was refused or returned no access token
    #[error("console login failed: {0}")]
    Login(String),

    /// Still unauthorized after a fresh login
    #[error("console session rejected after re-login")]
    Unauthorized,

    /// Response body did not match the expected shape
    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },

    /// Bad base URL or client construction failure
    #[error("console client error: {0}")]
    Client(String),
}

impl SourceError {
    pub(crate) fn request(url: &str, err: &reqwest::Error) -> Self {
        Self::Request {
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn decode(url: &str, err: impl std::fmt::Display) -> Self {
        Self::Decode {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

/// Errors that abort one export run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ExporterError),

    #[error("failed to list upstream apps: {0}")]
    Source(#[from] SourceError),

    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The in-flight run did not finish within the shutdown timeout
    #[error("export run still in flight after {}", humantime::format_duration(*.timeout))]
    ShutdownTimeout { timeout: Duration },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
