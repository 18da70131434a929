//! One export run: upstream rows in, partner batches out.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use exporter_config::ExporterConfig;
use exporter_core::{AggregationPeriod, Timestamp};
use exporter_delivery::{DeliveryError, ExternalApiSender, ResendSummary, SendOutcome};
use exporter_transform::{AppTokenCostRow, Normalizer, PeriodAggregator, Transformer};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::source::{ConsoleClient, TokenCostQuery, UsageSource};

/// Usage dates covered by a run, `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExportWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ExportWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// The `days` whole days before the UTC day containing `now`.
    pub fn trailing_days(days: u32, now: Timestamp) -> Self {
        let end = now.date_naive();
        let start = end
            .checked_sub_days(Days::new(u64::from(days)))
            .unwrap_or(NaiveDate::MIN);
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

impl fmt::Display for ExportWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// What one run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub apps: usize,
    /// Apps whose rows could not be fetched
    pub apps_failed: usize,
    pub rows: usize,
    /// Aggregated model records sent
    pub records: usize,
    pub batches: usize,
    pub delivered: usize,
    pub already_recorded: usize,
    pub spooled: usize,
    pub rejected: usize,
    #[serde(skip)]
    pub resend: ResendSummary,
    #[serde(skip)]
    pub duration: Duration,
}

/// Fetch, aggregate, normalize, transform, deliver.
pub struct ExportPipeline {
    source: Arc<dyn UsageSource>,
    aggregator: PeriodAggregator,
    normalizer: Normalizer,
    transformer: Transformer,
    sender: ExternalApiSender,
    max_batch_size: usize,
}

impl fmt::Debug for ExportPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportPipeline")
            .field("period", &self.aggregator.period())
            .field("max_batch_size", &self.max_batch_size)
            .field("sender", &self.sender)
            .finish_non_exhaustive()
    }
}

impl ExportPipeline {
    /// Batches are stamped with the sender's tenant, version and period.
    pub fn new(
        source: Arc<dyn UsageSource>,
        sender: ExternalApiSender,
        max_batch_size: usize,
    ) -> Self {
        let context = sender.context().clone();
        Self {
            source,
            aggregator: PeriodAggregator::new(context.aggregation_period),
            normalizer: Normalizer::new(),
            transformer: Transformer::new(context),
            sender,
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Build the console client and sender from validated configuration.
    pub fn from_config(config: &ExporterConfig) -> Result<Self> {
        config.validate_source()?;
        let source = ConsoleClient::new(&config.source)?;
        let sender = ExternalApiSender::from_exporter_config(config)?;
        Ok(Self::new(
            Arc::new(source),
            sender,
            config.delivery.max_batch_size,
        ))
    }

    pub fn sender(&self) -> &ExternalApiSender {
        &self.sender
    }

    pub fn period(&self) -> AggregationPeriod {
        self.aggregator.period()
    }

    /// Rows for every app; an app that fails is logged and skipped.
    async fn collect_rows(
        &self,
        window: ExportWindow,
        summary: &mut RunSummary,
    ) -> Result<Vec<AppTokenCostRow>> {
        let apps = self.source.fetch_apps().await?;
        summary.apps = apps.len();

        let mut rows = Vec::new();
        for app in &apps {
            let query = TokenCostQuery::new(app, window.start, window.end);
            match self.source.fetch_app_token_costs(&query).await {
                Ok(app_rows) => {
                    debug!(app_id = %app.id, rows = app_rows.len(), "collected app usage");
                    rows.extend(app_rows);
                }
                Err(e) => {
                    warn!(app_id = %app.id, app_name = %app.name, error = %e, "skipping app");
                    summary.apps_failed += 1;
                }
            }
        }
        summary.rows = rows.len();
        Ok(rows)
    }

    /// One full run over `window`, then a pass over the spool backlog.
    ///
    /// An empty window returns an empty summary without touching upstream.
    ///
    /// Transform errors and spool write failures abort the run. Batches the
    /// partner rejects are logged and counted; the run carries on.
    pub async fn run_once(&self, window: ExportWindow) -> Result<RunSummary> {
        if window.is_empty() {
            info!(window = %window, "export window is empty; nothing to do");
            return Ok(RunSummary::default());
        }

        let started = Instant::now();
        let mut summary = RunSummary::default();
        info!(window = %window, period = %self.period(), "export run started");

        let rows = self.collect_rows(window, &mut summary).await?;
        let aggregated = self.aggregator.aggregate(&rows);
        let normalized = self.normalizer.normalize(&aggregated);
        summary.records = normalized.len();

        if normalized.is_empty() {
            info!(window = %window, apps = summary.apps, "no usage in window");
        } else {
            let batches = self
                .transformer
                .transform_chunked(&normalized, self.max_batch_size)?;
            summary.batches = batches.len();

            for batch in &batches {
                match self.sender.send(batch).await {
                    Ok(SendOutcome::Delivered { .. }) => summary.delivered += 1,
                    Ok(SendOutcome::AlreadyRecorded { .. }) => summary.already_recorded += 1,
                    Ok(SendOutcome::Spooled { .. }) => summary.spooled += 1,
                    Err(DeliveryError::Rejected { status, message }) => {
                        error!(
                            batch_key = %batch.idempotency_key,
                            status,
                            message = %message,
                            "batch rejected by partner API"
                        );
                        summary.rejected += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        summary.resend = self.sender.resend_spooled().await?;
        summary.duration = started.elapsed();

        info!(
            apps = summary.apps,
            apps_failed = summary.apps_failed,
            records = summary.records,
            batches = summary.batches,
            delivered = summary.delivered,
            already_recorded = summary.already_recorded,
            spooled = summary.spooled,
            rejected = summary.rejected,
            resent = summary.resend.delivered,
            duration_ms = summary.duration.as_millis() as u64,
            "export run finished"
        );
        Ok(summary)
    }
}
