//! Error types for the transform stage.

use thiserror::Error;

/// Transform errors. Any of these aborts the whole batch.
#[derive(Error, Debug)]
pub enum TransformError {
    /// Nothing to export
    #[error("cannot build an export batch from zero records")]
    EmptyBatch,

    /// A record whose token breakdown does not add up
    #[error(
        "token mismatch in record {index} ({usage_date} {model}): {input_tokens} + {output_tokens} != {total_tokens}"
    )]
    TokenMismatch {
        /// Position of the record in the input
        index: usize,
        usage_date: String,
        model: String,
        input_tokens: i64,
        output_tokens: i64,
        total_tokens: i64,
    },

    /// A usage date that is not `YYYY-MM-DD`
    #[error("invalid usage date: {value:?}")]
    InvalidDate { value: String },

    /// The assembled request violates the partner wire schema
    #[error("export request failed schema validation: {0}")]
    Schema(#[from] validator::ValidationErrors),
}

impl TransformError {
    /// Short machine-friendly name, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyBatch => "empty_batch",
            Self::TokenMismatch { .. } => "token_mismatch",
            Self::InvalidDate { .. } => "invalid_date",
            Self::Schema(_) => "schema",
        }
    }
}

/// Result alias for transform operations.
pub type Result<T> = std::result::Result<T, TransformError>;
