//! Folds raw daily rows into per-period records.

use std::collections::BTreeMap;
use std::str::FromStr;

use exporter_core::AggregationPeriod;
use exporter_core::types::parse_date;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::models::{AggregatedModelRecord, AppTokenCostRow};
use crate::normalizer::{normalize_model, normalize_provider};

/// Running sum of a price column.
///
/// Once a row carries an unparsable price the sum keeps that raw string so
/// the record fails validation later instead of being under-reported.
#[derive(Debug, Clone)]
enum PriceSum {
    Valid(Decimal),
    Invalid(String),
}

impl PriceSum {
    fn add(&mut self, raw: &str) {
        let Self::Valid(sum) = self else {
            return;
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return;
        }
        match Decimal::from_str(trimmed).or_else(|_| Decimal::from_scientific(trimmed)) {
            Ok(value) => *sum += value,
            Err(_) => *self = Self::Invalid(raw.to_string()),
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Valid(sum) => sum.normalize().to_string(),
            Self::Invalid(raw) => raw.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct GroupKey {
    period: String,
    app_id: String,
    provider: String,
    model: String,
    user_id: Option<String>,
}

struct Group {
    app_name: String,
    user_type: Option<String>,
    currency: String,
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
    prompt_price: PriceSum,
    completion_price: PriceSum,
    total_price: PriceSum,
    execution_count: u32,
}

/// Aggregates raw rows for one aggregation period.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeriodAggregator {
    period: AggregationPeriod,
}

impl PeriodAggregator {
    pub fn new(period: AggregationPeriod) -> Self {
        Self { period }
    }

    pub fn period(&self) -> AggregationPeriod {
        self.period
    }

    /// Group rows by (period start, app, provider, model, user) and sum them.
    ///
    /// Provider and model are canonicalized before grouping, so alias and
    /// case variants of the same model fold into one record. Output is
    /// sorted by period, app, provider, model. Rows with an unparsable date
    /// are skipped. Token sums saturate at `i64::MAX`.
    pub fn aggregate(&self, rows: &[AppTokenCostRow]) -> Vec<AggregatedModelRecord> {
        let mut groups: BTreeMap<GroupKey, Group> = BTreeMap::new();
        let mut skipped = 0usize;

        for row in rows {
            let Some(date) = parse_date(row.date.trim()) else {
                warn!(date = %row.date, app_id = %row.app_id, "skipping row with invalid date");
                skipped += 1;
                continue;
            };

            let key = GroupKey {
                period: self.period.period_start(date).format("%Y-%m-%d").to_string(),
                app_id: row.app_id.clone(),
                provider: normalize_provider(&row.model_provider),
                model: normalize_model(&row.model_name),
                user_id: row.user_id.clone(),
            };

            let group = groups.entry(key).or_insert_with(|| Group {
                app_name: row.app_name.clone(),
                user_type: row.user_type.clone(),
                currency: row.currency.clone(),
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
                prompt_price: PriceSum::Valid(Decimal::ZERO),
                completion_price: PriceSum::Valid(Decimal::ZERO),
                total_price: PriceSum::Valid(Decimal::ZERO),
                execution_count: 0,
            });

            group.prompt_tokens = group.prompt_tokens.saturating_add(row.prompt_tokens);
            group.completion_tokens = group.completion_tokens.saturating_add(row.completion_tokens);
            group.total_tokens = group.total_tokens.saturating_add(row.total_tokens);
            group.prompt_price.add(&row.prompt_price);
            group.completion_price.add(&row.completion_price);
            group.total_price.add(&row.total_price);
            group.execution_count += 1;
        }

        debug!(
            rows = rows.len(),
            skipped,
            records = groups.len(),
            period = %self.period,
            "aggregated usage rows"
        );

        groups
            .into_iter()
            .map(|(key, group)| AggregatedModelRecord {
                period: key.period,
                period_type: self.period,
                app_id: key.app_id,
                app_name: group.app_name,
                user_id: key.user_id,
                user_type: group.user_type,
                model_provider: key.provider,
                model_name: key.model,
                prompt_tokens: group.prompt_tokens,
                completion_tokens: group.completion_tokens,
                total_tokens: group.total_tokens,
                prompt_price: group.prompt_price.render(),
                completion_price: group.completion_price.render(),
                total_price: group.total_price.render(),
                currency: group.currency,
                execution_count: group.execution_count,
            })
            .collect()
    }
}
