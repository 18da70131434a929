//! Builds validated partner requests from normalized records.

use exporter_core::types::{self, Timestamp, parse_date};
use exporter_core::AggregationPeriod;
use tracing::debug;
use validator::Validate;

use crate::error::{Result, TransformError};
use crate::idempotency;
use crate::models::{ExportBatch, NormalizedModelRecord};
use crate::wire::{
    AGGREGATION_METHOD, CURRENCY, DateRange, ExportMetadata, SOURCE_SYSTEM, UsageExportRequest,
    UsageWireRecord, WireRecordMetadata,
};

/// Request-level fields that do not come from the records.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchContext {
    pub tenant_id: String,
    pub exporter_version: String,
    pub aggregation_period: AggregationPeriod,
}

impl BatchContext {
    pub fn new(
        tenant_id: impl Into<String>,
        exporter_version: impl Into<String>,
        aggregation_period: AggregationPeriod,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            exporter_version: exporter_version.into(),
            aggregation_period,
        }
    }

    /// Wrap wire records in a validated request stamped now.
    pub fn build_batch(&self, records: Vec<UsageWireRecord>) -> Result<ExportBatch> {
        self.build_batch_at(records, types::now())
    }

    /// Wrap wire records in a validated request with an explicit timestamp.
    ///
    /// Used both for fresh batches and to rebuild spooled ones.
    pub fn build_batch_at(
        &self,
        records: Vec<UsageWireRecord>,
        export_timestamp: Timestamp,
    ) -> Result<ExportBatch> {
        if records.is_empty() {
            return Err(TransformError::EmptyBatch);
        }

        let date_range = date_range(&records)?;
        let record_keys: Vec<String> = records.iter().map(UsageWireRecord::record_key).collect();
        let idempotency_key = idempotency::batch_key(&record_keys);

        let request = UsageExportRequest {
            tenant_id: self.tenant_id.clone(),
            export_metadata: ExportMetadata {
                exporter_version: self.exporter_version.clone(),
                export_timestamp: types::format_instant(&export_timestamp),
                aggregation_period: self.aggregation_period,
                source_system: SOURCE_SYSTEM.to_string(),
                date_range,
            },
            records,
        };

        request.validate()?;

        Ok(ExportBatch {
            record_count: request.records.len(),
            request,
            idempotency_key,
        })
    }
}

/// `[min usage date, max usage date]`, both as midnight UTC instants.
fn date_range(records: &[UsageWireRecord]) -> Result<DateRange> {
    let mut min = None;
    let mut max = None;

    for record in records {
        let date = parse_date(&record.usage_date).ok_or_else(|| TransformError::InvalidDate {
            value: record.usage_date.clone(),
        })?;
        min = Some(min.map_or(date, |m: chrono::NaiveDate| m.min(date)));
        max = Some(max.map_or(date, |m: chrono::NaiveDate| m.max(date)));
    }

    match (min, max) {
        (Some(min), Some(max)) => Ok(DateRange {
            start: types::start_of_day_instant(min),
            end: types::start_of_day_instant(max),
        }),
        _ => Err(TransformError::EmptyBatch),
    }
}

/// Converts normalized records into export batches.
#[derive(Debug, Clone)]
pub struct Transformer {
    context: BatchContext,
}

impl Transformer {
    pub fn new(context: BatchContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &BatchContext {
        &self.context
    }

    /// Build one wire record, checking the token breakdown.
    ///
    /// A breakdown whose sum overflows `i64` is reported as a mismatch.
    pub fn to_wire_record(index: usize, record: &NormalizedModelRecord) -> Result<UsageWireRecord> {
        if record.input_tokens.checked_add(record.output_tokens) != Some(record.total_tokens) {
            return Err(TransformError::TokenMismatch {
                index,
                usage_date: record.usage_date.clone(),
                model: record.model.clone(),
                input_tokens: record.input_tokens,
                output_tokens: record.output_tokens,
                total_tokens: record.total_tokens,
            });
        }

        let source_event_id = idempotency::source_event_id(
            &record.usage_date,
            &record.provider,
            &record.model,
            record.app_id.as_deref(),
            record.user_id.as_deref(),
        );

        Ok(UsageWireRecord {
            usage_date: record.usage_date.clone(),
            provider: record.provider.clone(),
            model: record.model.clone(),
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            total_tokens: record.total_tokens,
            request_count: 1,
            cost_actual: record.cost_actual,
            currency: CURRENCY.to_string(),
            metadata: WireRecordMetadata {
                source_system: SOURCE_SYSTEM.to_string(),
                source_event_id,
                source_app_id: record.app_id.clone(),
                source_app_name: record.app_name.clone(),
                aggregation_method: AGGREGATION_METHOD.to_string(),
                time_range: None,
            },
        })
    }

    /// Transform all records into a single batch.
    ///
    /// One bad record fails the whole batch.
    pub fn transform(&self, records: &[NormalizedModelRecord]) -> Result<ExportBatch> {
        if records.is_empty() {
            return Err(TransformError::EmptyBatch);
        }

        let wire = records
            .iter()
            .enumerate()
            .map(|(i, r)| Self::to_wire_record(i, r))
            .collect::<Result<Vec<_>>>()?;

        let batch = self.context.build_batch(wire)?;
        debug!(
            records = batch.record_count,
            batch_key = %batch.idempotency_key,
            start = %batch.request.export_metadata.date_range.start,
            end = %batch.request.export_metadata.date_range.end,
            "transformed batch"
        );
        Ok(batch)
    }

    /// Transform records into batches of at most `max_batch_size` records.
    ///
    /// All records are checked before any batch is built.
    pub fn transform_chunked(
        &self,
        records: &[NormalizedModelRecord],
        max_batch_size: usize,
    ) -> Result<Vec<ExportBatch>> {
        if records.is_empty() {
            return Err(TransformError::EmptyBatch);
        }

        let wire = records
            .iter()
            .enumerate()
            .map(|(i, r)| Self::to_wire_record(i, r))
            .collect::<Result<Vec<_>>>()?;

        wire.chunks(max_batch_size.max(1))
            .map(|chunk| self.context.build_batch(chunk.to_vec()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TENANT: &str = "6f1c2a4e-58b1-4a57-9a53-0c6b9d0f3e21";

    fn transformer() -> Transformer {
        Transformer::new(BatchContext::new(TENANT, "0.3.0", AggregationPeriod::Daily))
    }

    fn record(date: &str, app: &str, tokens: (i64, i64, i64)) -> NormalizedModelRecord {
        NormalizedModelRecord {
            provider: "aws".to_string(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            input_tokens: tokens.0,
            output_tokens: tokens.1,
            total_tokens: tokens.2,
            cost_actual: 0.25,
            usage_date: date.to_string(),
            app_id: Some(app.to_string()),
            app_name: Some("Support Bot".to_string()),
            user_id: None,
        }
    }

    #[test]
    fn test_empty_input_is_error() {
        let err = transformer().transform(&[]).unwrap_err();
        assert!(matches!(err, TransformError::EmptyBatch));
    }

    #[test]
    fn test_date_range_spans_min_and_max() {
        let batch = transformer()
            .transform(&[record("2025-12-05", "a", (1, 1, 2)), record("2025-12-01", "b", (1, 1, 2))])
            .unwrap();

        let range = &batch.request.export_metadata.date_range;
        assert_eq!(range.start, "2025-12-01T00:00:00.000Z");
        assert_eq!(range.end, "2025-12-05T00:00:00.000Z");
        assert_eq!(batch.record_count, 2);
    }

    #[test]
    fn test_token_mismatch_aborts_batch() {
        let err = transformer()
            .transform(&[record("2025-12-01", "a", (1, 1, 2)), record("2025-12-02", "a", (10, 5, 16))])
            .unwrap_err();

        match err {
            TransformError::TokenMismatch { index, total_tokens, .. } => {
                assert_eq!(index, 1);
                assert_eq!(total_tokens, 16);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_token_overflow_is_mismatch() {
        let err = Transformer::to_wire_record(0, &record("2025-12-01", "a", (i64::MAX, 1, i64::MIN)))
            .unwrap_err();
        assert!(matches!(err, TransformError::TokenMismatch { index: 0, .. }), "{err:?}");
    }

    #[test]
    fn test_wire_constants() {
        let batch = transformer().transform(&[record("2025-12-01", "a", (1, 2, 3))]).unwrap();
        let wire = &batch.request.records[0];
        assert_eq!(wire.request_count, 1);
        assert_eq!(wire.currency, "USD");
        assert_eq!(wire.metadata.aggregation_method, "daily_sum");
        assert_eq!(wire.metadata.source_system, "dify");
        assert_eq!(wire.metadata.source_app_name.as_deref(), Some("Support Bot"));
        assert_eq!(batch.request.tenant_id, TENANT);
        assert_eq!(batch.request.export_metadata.source_system, "dify");
    }

    #[test]
    fn test_nan_cost_fails_schema() {
        let mut bad = record("2025-12-01", "a", (1, 2, 3));
        bad.cost_actual = f64::NAN;
        let err = transformer().transform(&[bad]).unwrap_err();
        assert!(matches!(err, TransformError::Schema(_)));
    }

    #[test]
    fn test_invalid_tenant_fails_schema() {
        let t = Transformer::new(BatchContext::new("tenant-1", "0.3.0", AggregationPeriod::Daily));
        let err = t.transform(&[record("2025-12-01", "a", (1, 2, 3))]).unwrap_err();
        assert!(matches!(err, TransformError::Schema(_)));
    }

    #[test]
    fn test_batch_key_ignores_record_order() {
        let a = record("2025-12-01", "a", (1, 1, 2));
        let b = record("2025-12-02", "b", (1, 1, 2));
        let t = transformer();
        let first = t.transform(&[a.clone(), b.clone()]).unwrap();
        let second = t.transform(&[b, a]).unwrap();
        assert_eq!(first.idempotency_key, second.idempotency_key);
    }

    #[test]
    fn test_chunked_batches() {
        let records: Vec<_> = (1..=5)
            .map(|d| record(&format!("2025-12-0{d}"), "a", (1, 1, 2)))
            .collect();
        let batches = transformer().transform_chunked(&records, 2).unwrap();

        assert_eq!(batches.iter().map(|b| b.record_count).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert_ne!(batches[0].idempotency_key, batches[1].idempotency_key);
        assert_eq!(
            batches[2].request.export_metadata.date_range.start,
            "2025-12-05T00:00:00.000Z"
        );
    }

    #[test]
    fn test_rebuild_keeps_identity() {
        let t = transformer();
        let batch = t.transform(&[record("2025-12-01", "a", (1, 1, 2))]).unwrap();
        let rebuilt = t
            .context()
            .build_batch(batch.request.records.clone())
            .unwrap();
        assert_eq!(rebuilt.idempotency_key, batch.idempotency_key);
        assert_eq!(rebuilt.request.records, batch.request.records);
    }
}
