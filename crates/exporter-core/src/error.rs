//! Error types for usage-exporter startup and configuration.
//!
//! [`ExporterError`] covers the failures that happen before the pipeline is
//! running: reading configuration, preparing directories, setting up logging.
//! Pipeline stages carry their own error enums and convert into this one at
//! the command boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`ExporterError`].
pub type Result<T> = std::result::Result<T, ExporterError>;

/// Error type for configuration, filesystem and startup failures.
#[derive(Debug, Error)]
pub enum ExporterError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration file not found
    #[error("Configuration not found at {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration file is invalid YAML
    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String },

    /// Missing required configuration field
    #[error("Missing required config field: {field} (set {env_var})")]
    ConfigMissingField { field: String, env_var: String },

    /// Environment variable present but unparsable
    #[error("Invalid value for {env_var}: {message}")]
    ConfigEnvInvalid { env_var: String, message: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error with context
    #[error("I/O error {operation}: {path}")]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory creation failed
    #[error("Failed to create directory: {path}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (bug in usage-exporter)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ExporterError {
    /// Create a ConfigNotFound error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Self::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a ConfigNotFound error with source
    pub fn config_not_found_with_source(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ConfigNotFound {
            path: path.into(),
            source: Some(source),
        }
    }

    /// Create a ConfigValidation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Create a ConfigMissingField error
    pub fn missing_field(field: impl Into<String>, env_var: impl Into<String>) -> Self {
        Self::ConfigMissingField {
            field: field.into(),
            env_var: env_var.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound { .. }
                | Self::ConfigInvalid { .. }
                | Self::ConfigValidation { .. }
                | Self::ConfigMissingField { .. }
                | Self::ConfigEnvInvalid { .. }
        )
    }

    /// Returns actionable guidance for the operator
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::ConfigNotFound { .. } => {
                Some("Pass --config with an existing file or rely on environment variables")
            }
            Self::ConfigInvalid { .. } => Some("Check YAML syntax in the configuration file"),
            Self::ConfigMissingField { .. } => {
                Some("Set the named environment variable or add the field to the config file")
            }
            Self::DirectoryCreation { .. } => {
                Some("Check that the spool and log directories are writable")
            }
            _ => None,
        }
    }
}
