//! Data models for the export pipeline, from raw upstream rows to batches.

use exporter_core::AggregationPeriod;
use serde::{Deserialize, Serialize};

use crate::wire::UsageExportRequest;

/// One app/model/day row as returned by the upstream console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppTokenCostRow {
    /// Usage date (`YYYY-MM-DD`)
    pub date: String,

    pub app_id: String,

    #[serde(default)]
    pub app_name: String,

    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default)]
    pub user_type: Option<String>,

    /// Provider as reported upstream (e.g. "aws-bedrock")
    pub model_provider: String,

    /// Model as reported upstream (e.g. "claude-3-5-sonnet")
    pub model_name: String,

    #[serde(default)]
    pub prompt_tokens: i64,

    #[serde(default)]
    pub completion_tokens: i64,

    #[serde(default)]
    pub total_tokens: i64,

    /// Decimal string, e.g. "0.0120"
    #[serde(default)]
    pub prompt_price: String,

    #[serde(default)]
    pub completion_price: String,

    #[serde(default)]
    pub total_price: String,

    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// Usage of one model by one app over one aggregation period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedModelRecord {
    /// First day of the period (`YYYY-MM-DD`)
    pub period: String,

    pub period_type: AggregationPeriod,

    pub app_id: String,

    pub app_name: String,

    pub user_id: Option<String>,

    pub user_type: Option<String>,

    pub model_provider: String,

    pub model_name: String,

    pub prompt_tokens: i64,

    pub completion_tokens: i64,

    pub total_tokens: i64,

    pub prompt_price: String,

    pub completion_price: String,

    pub total_price: String,

    pub currency: String,

    /// Number of raw rows folded into this record
    pub execution_count: u32,
}

impl AggregatedModelRecord {
    /// Create a daily record with zero usage.
    pub fn new(
        period: impl Into<String>,
        app_id: impl Into<String>,
        model_provider: impl Into<String>,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            period: period.into(),
            period_type: AggregationPeriod::Daily,
            app_id: app_id.into(),
            app_name: String::new(),
            user_id: None,
            user_type: None,
            model_provider: model_provider.into(),
            model_name: model_name.into(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            prompt_price: "0".to_string(),
            completion_price: "0".to_string(),
            total_price: "0".to_string(),
            currency: default_currency(),
            execution_count: 1,
        }
    }

    /// Set token counts.
    pub fn with_tokens(mut self, prompt: i64, completion: i64, total: i64) -> Self {
        self.prompt_tokens = prompt;
        self.completion_tokens = completion;
        self.total_tokens = total;
        self
    }

    /// Set the total price.
    pub fn with_total_price(mut self, price: impl Into<String>) -> Self {
        self.total_price = price.into();
        self
    }

    /// Set the app name.
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Set the user id.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// A record with canonical provider/model names and a numeric cost.
///
/// Token counts are copied through unchanged; the transformer checks them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedModelRecord {
    pub provider: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    /// NaN when the upstream price could not be parsed
    pub cost_actual: f64,
    pub usage_date: String,
    pub app_id: Option<String>,
    pub app_name: Option<String>,
    pub user_id: Option<String>,
}

/// A validated request ready to POST, with its identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportBatch {
    pub request: UsageExportRequest,
    pub record_count: usize,
    /// SHA-256 over the sorted record keys
    pub idempotency_key: String,
}
