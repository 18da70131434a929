//! Partner billing API wire schema.
//!
//! Every request is validated against these rules before it leaves the
//! process, and every spooled batch is validated again when read back.

use std::borrow::Cow;

use exporter_core::AggregationPeriod;
use exporter_core::types::{parse_date, parse_instant};
use serde::{Deserialize, Deserializer, Serialize};
use validator::{Validate, ValidationError};

use crate::idempotency;
use crate::normalizer;

/// `source_system` value on every request and record.
pub const SOURCE_SYSTEM: &str = "dify";

/// Records are pre-aggregated daily sums upstream.
pub const AGGREGATION_METHOD: &str = "daily_sum";

pub const CURRENCY: &str = "USD";

/// Request body for `POST <EXTERNAL_API_URL>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_date_range_order"))]
pub struct UsageExportRequest {
    #[validate(custom(function = "validate_uuid"))]
    pub tenant_id: String,

    #[validate(nested)]
    pub export_metadata: ExportMetadata,

    #[validate(length(min = 1), nested)]
    pub records: Vec<UsageWireRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ExportMetadata {
    #[validate(length(min = 1))]
    pub exporter_version: String,

    #[validate(custom(function = "validate_instant"))]
    pub export_timestamp: String,

    pub aggregation_period: AggregationPeriod,

    #[validate(length(min = 1))]
    pub source_system: String,

    #[validate(nested)]
    pub date_range: DateRange,
}

/// Inclusive instant range, ISO-8601 with a `Z` suffix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct DateRange {
    #[validate(custom(function = "validate_instant"))]
    pub start: String,

    #[validate(custom(function = "validate_instant"))]
    pub end: String,
}

/// One usage record in the partner's shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_record_totals"))]
pub struct UsageWireRecord {
    #[validate(custom(function = "validate_usage_date"))]
    pub usage_date: String,

    #[validate(length(min = 1))]
    pub provider: String,

    pub model: String,

    #[validate(range(min = 0))]
    pub input_tokens: i64,

    #[validate(range(min = 0))]
    pub output_tokens: i64,

    #[validate(range(min = 0))]
    pub total_tokens: i64,

    #[validate(range(min = 0))]
    pub request_count: i64,

    pub cost_actual: f64,

    #[validate(length(min = 1))]
    pub currency: String,

    #[validate(nested)]
    pub metadata: WireRecordMetadata,
}

impl UsageWireRecord {
    /// Per-record idempotency key.
    pub fn record_key(&self) -> String {
        idempotency::record_key(
            &self.usage_date,
            self.metadata.source_app_id.as_deref().unwrap_or_default(),
            &self.provider,
            &self.model,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct WireRecordMetadata {
    #[validate(length(min = 1))]
    pub source_system: String,

    #[validate(length(min = 1))]
    pub source_event_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_app_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_app_name: Option<String>,

    #[validate(length(min = 1))]
    pub aggregation_method: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub time_range: Option<DateRange>,
}

/// Flat record shape written by older exporter releases.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LegacyExportRecord {
    pub date: String,
    pub app_id: String,
    #[serde(default)]
    pub app_name: Option<String>,
    pub provider: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub cost_actual: f64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl LegacyExportRecord {
    /// Convert to the current wire shape, re-normalizing provider and model.
    pub fn upgrade(self) -> UsageWireRecord {
        let provider = normalizer::normalize_provider(&self.provider);
        let model = normalizer::normalize_model(&self.model);
        let app_id = (!self.app_id.is_empty()).then_some(self.app_id);
        let source_event_id =
            idempotency::source_event_id(&self.date, &provider, &model, app_id.as_deref(), None);

        UsageWireRecord {
            usage_date: self.date,
            provider,
            model,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.total_tokens,
            request_count: 1,
            cost_actual: self.cost_actual,
            currency: CURRENCY.to_string(),
            metadata: WireRecordMetadata {
                source_system: SOURCE_SYSTEM.to_string(),
                source_event_id,
                source_app_id: app_id,
                source_app_name: self.app_name,
                aggregation_method: AGGREGATION_METHOD.to_string(),
                time_range: None,
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredRecord {
    Current(UsageWireRecord),
    Legacy(LegacyExportRecord),
}

/// Deserialize a record list that may mix current and legacy shapes.
///
/// For use with `#[serde(deserialize_with = "...")]`.
pub fn deserialize_records<'de, D>(deserializer: D) -> Result<Vec<UsageWireRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    let stored = Vec::<StoredRecord>::deserialize(deserializer)?;
    Ok(stored
        .into_iter()
        .map(|record| match record {
            StoredRecord::Current(record) => record,
            StoredRecord::Legacy(legacy) => legacy.upgrade(),
        })
        .collect())
}

fn invalid(code: &'static str, message: String) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(Cow::from(message));
    err
}

fn validate_uuid(value: &str) -> Result<(), ValidationError> {
    uuid::Uuid::parse_str(value)
        .map(|_| ())
        .map_err(|_| invalid("uuid", format!("'{value}' is not a UUID")))
}

fn validate_instant(value: &str) -> Result<(), ValidationError> {
    match parse_instant(value) {
        Some(_) => Ok(()),
        None => Err(invalid("instant", format!("'{value}' is not an ISO-8601 instant"))),
    }
}

fn validate_usage_date(value: &str) -> Result<(), ValidationError> {
    match parse_date(value) {
        Some(_) => Ok(()),
        None => Err(invalid("usage_date", format!("'{value}' is not YYYY-MM-DD"))),
    }
}

fn validate_record_totals(record: &UsageWireRecord) -> Result<(), ValidationError> {
    if !record.cost_actual.is_finite() || record.cost_actual < 0.0 {
        return Err(invalid(
            "cost_actual",
            format!("cost_actual must be a finite number >= 0, got {}", record.cost_actual),
        ));
    }
    let Some(sum) = record.input_tokens.checked_add(record.output_tokens) else {
        return Err(invalid(
            "token_overflow",
            format!(
                "{} + {} overflows a 64-bit token count",
                record.input_tokens, record.output_tokens
            ),
        ));
    };
    if sum != record.total_tokens {
        return Err(invalid(
            "total_tokens",
            format!(
                "{} + {} != {}",
                record.input_tokens, record.output_tokens, record.total_tokens
            ),
        ));
    }
    Ok(())
}

fn validate_date_range_order(request: &UsageExportRequest) -> Result<(), ValidationError> {
    let range = &request.export_metadata.date_range;
    match (parse_instant(&range.start), parse_instant(&range.end)) {
        (Some(start), Some(end)) if start > end => Err(invalid(
            "date_range",
            format!("date_range start {} is after end {}", range.start, range.end),
        )),
        _ => Ok(()),
    }
}
