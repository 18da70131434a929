//! Delivery to the partner billing API.
//!
//! Each POST goes through the retry policy: 2xx and 409 are success,
//! 400/401/403/404 are surfaced immediately, network failures, 5xx and 429
//! are retried with backoff. Anything still undelivered is spooled, so a
//! batch is never lost silently.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use exporter_config::ExporterConfig;
use exporter_core::log_delivery_event;
use exporter_core::recovery::{RetryConfig, retry_with_backoff_async};
use exporter_core::types;
use exporter_transform::{BatchContext, ExportBatch, UsageExportRequest};
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, Result, SendError};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::retry_policy;
use crate::spool::{SpoolEntry, SpoolFile, SpoolManager};

/// Header carrying the batch idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Longest response body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Show only the first four characters of a credential.
pub fn mask_token(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    if token.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{prefix}****")
    }
}

fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(MAX_ERROR_BODY).collect();
        format!("{cut}...")
    }
}

/// Sender settings.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub api_url: String,
    pub api_token: String,
    pub timeout: Duration,
    /// In-process retry schedule for one send
    pub retry: RetryConfig,
    /// Failed resends before a spooled batch is quarantined
    pub max_retry_count: u32,
}

impl SenderConfig {
    pub fn from_exporter_config(config: &ExporterConfig) -> Self {
        Self {
            api_url: config.delivery.api_url.clone(),
            api_token: config.delivery.api_token.expose().to_string(),
            timeout: Duration::from_secs(config.delivery.timeout_secs),
            retry: RetryConfig::with_max_retries(config.delivery.max_retries),
            max_retry_count: config.spool.max_retry_count,
        }
    }
}

/// Result of a successful [`ExternalApiSender::send`].
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Accepted with a 2xx response
    Delivered { attempts: u32 },
    /// 409: the partner already has this batch
    AlreadyRecorded { attempts: u32 },
    /// Not delivered; stored for a later resend
    Spooled {
        path: PathBuf,
        attempts: u32,
        error: String,
    },
}

impl SendOutcome {
    /// True when the partner has the batch.
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. } | Self::AlreadyRecorded { .. })
    }
}

/// Successful POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acceptance {
    Delivered,
    AlreadyRecorded,
}

/// Totals from one pass over the spool directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResendSummary {
    /// Spool files found
    pub total: usize,
    /// Delivered (2xx or 409) and deleted
    pub delivered: usize,
    /// Failed again and left in the spool
    pub retained: usize,
    /// Moved to the failed directory
    pub quarantined: usize,
}

/// Outcome of resending one failed file.
#[derive(Debug)]
pub struct FailedResend {
    pub file_name: String,
    pub record_count: usize,
    pub result: Result<SendOutcome>,
}

/// POSTs batches to the partner API and owns the spool.
#[derive(Debug, Clone)]
pub struct ExternalApiSender {
    client: reqwest::Client,
    config: SenderConfig,
    context: BatchContext,
    spool: SpoolManager,
}

impl ExternalApiSender {
    pub fn new(config: SenderConfig, context: BatchContext, spool: SpoolManager) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DeliveryError::Client(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            context,
            spool,
        })
    }

    /// Build a sender, spool and notifier from the exporter configuration.
    pub fn from_exporter_config(config: &ExporterConfig) -> Result<Self> {
        let notifier: Arc<dyn Notifier> = match &config.notification.webhook_url {
            Some(url) => Arc::new(
                WebhookNotifier::new(url.clone())
                    .map_err(|e| DeliveryError::Client(e.to_string()))?,
            ),
            None => Arc::new(LogNotifier),
        };
        let spool = SpoolManager::new(&config.spool.dir, &config.spool.failed_dir)
            .with_notifier(notifier);
        let context = BatchContext::new(
            config.delivery.tenant_id.trim(),
            config.delivery.exporter_version.clone(),
            config.export.aggregation_period,
        );

        Self::new(SenderConfig::from_exporter_config(config), context, spool)
    }

    pub fn spool(&self) -> &SpoolManager {
        &self.spool
    }

    pub fn context(&self) -> &BatchContext {
        &self.context
    }

    /// One POST, classified at the boundary.
    async fn post_once(
        &self,
        request: &UsageExportRequest,
        idempotency_key: &str,
    ) -> std::result::Result<Acceptance, SendError> {
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_token)
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .header(CONTENT_TYPE, "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| SendError::from_reqwest(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(Acceptance::Delivered);
        }

        let retry_after = retry_policy::parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        let err = SendError::http(status.as_u16(), truncate_body(&body), retry_after);

        if retry_policy::is_conflict(&err) {
            return Ok(Acceptance::AlreadyRecorded);
        }
        Err(err)
    }

    /// POST with in-process retries. Returns the final result and attempt count.
    async fn deliver(
        &self,
        request: &UsageExportRequest,
        idempotency_key: &str,
    ) -> (std::result::Result<Acceptance, SendError>, u32) {
        debug!(
            url = %self.config.api_url,
            token = %mask_token(&self.config.api_token),
            batch_key = %idempotency_key,
            records = request.records.len(),
            "posting usage batch"
        );

        let outcome = retry_with_backoff_async(&self.config.retry, || {
            self.post_once(request, idempotency_key)
        })
        .await;

        (outcome.result, outcome.attempts)
    }

    /// Deliver a batch, spooling it if retries run out.
    ///
    /// Errors only for terminal client rejections and spool write failures.
    pub async fn send(&self, batch: &ExportBatch) -> Result<SendOutcome> {
        let key = &batch.idempotency_key;
        let (result, attempts) = self.deliver(&batch.request, key).await;

        match result {
            Ok(Acceptance::Delivered) => {
                log_delivery_event!(key, "delivered", records = batch.record_count, attempts);
                Ok(SendOutcome::Delivered { attempts })
            }
            Ok(Acceptance::AlreadyRecorded) => {
                log_delivery_event!(key, "already_recorded", records = batch.record_count, attempts);
                Ok(SendOutcome::AlreadyRecorded { attempts })
            }
            Err(err) if retry_policy::is_non_retryable(&err) => {
                warn!(batch_key = %key, error = %err, "batch rejected by partner API; not spooling");
                Err(DeliveryError::from_send_error(err, attempts))
            }
            Err(err) => {
                let error = err.to_string();
                let path = self
                    .spool
                    .save_to_spool(key, &batch.request.records, types::now(), &error)
                    .await?;
                log_delivery_event!(key, "spooled", attempts, error = %error, path = %path.display());
                Ok(SendOutcome::Spooled {
                    path,
                    attempts,
                    error,
                })
            }
        }
    }

    /// Replay the spool, oldest first.
    ///
    /// Success deletes the file. Failure bumps `retryCount` and records the
    /// error; at the ceiling the file moves to the failed directory.
    pub async fn resend_spooled(&self) -> Result<ResendSummary> {
        let entries = self.spool.list_spool_files().await?;
        let mut summary = ResendSummary {
            total: entries.len(),
            ..ResendSummary::default()
        };

        for SpoolEntry { file_name, mut file, .. } in entries {
            let key = file.batch_idempotency_key.clone();

            if file.at_ceiling(self.config.max_retry_count) {
                self.spool.move_to_failed(&file).await?;
                summary.quarantined += 1;
                continue;
            }

            let batch = match self.context.build_batch(file.records.clone()) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(file = %file_name, error = %e, "spooled batch no longer valid; quarantining");
                    file.last_error = e.to_string();
                    self.spool.move_to_failed(&file).await?;
                    summary.quarantined += 1;
                    continue;
                }
            };

            let (result, attempts) = self.deliver(&batch.request, &key).await;
            match result {
                Ok(acceptance) => {
                    self.spool.delete_spool_file(&key).await?;
                    let event = match acceptance {
                        Acceptance::Delivered => "resent",
                        Acceptance::AlreadyRecorded => "already_recorded",
                    };
                    log_delivery_event!(key, event, file = %file_name, attempts);
                    summary.delivered += 1;
                }
                Err(err) => {
                    file.retry_count = file.retry_count.saturating_add(1);
                    file.last_error = err.to_string();
                    if file.at_ceiling(self.config.max_retry_count) {
                        self.spool.move_to_failed(&file).await?;
                        summary.quarantined += 1;
                    } else {
                        self.spool.update_spool_file(&file).await?;
                        summary.retained += 1;
                    }
                    log_delivery_event!(
                        key,
                        "resend_failed",
                        retry_count = file.retry_count,
                        error = %err
                    );
                }
            }
        }

        if summary.total > 0 {
            info!(
                total = summary.total,
                delivered = summary.delivered,
                retained = summary.retained,
                quarantined = summary.quarantined,
                "spool resend complete"
            );
        }
        Ok(summary)
    }

    async fn resend_failed_entry(&self, entry: &SpoolEntry) -> Result<SendOutcome> {
        let batch = self.context.build_batch(entry.file.records.clone())?;
        let key = &entry.file.batch_idempotency_key;

        let (result, attempts) = self.deliver(&batch.request, key).await;
        let outcome = match result {
            Ok(Acceptance::Delivered) => SendOutcome::Delivered { attempts },
            Ok(Acceptance::AlreadyRecorded) => SendOutcome::AlreadyRecorded { attempts },
            Err(err) => {
                warn!(file = %entry.file_name, error = %err, "manual resend failed; file left in place");
                return Err(DeliveryError::from_send_error(err, attempts));
            }
        };

        self.spool.delete_failed_file(&entry.file_name).await?;
        log_delivery_event!(key, "failed_file_resent", file = %entry.file_name, attempts);
        Ok(outcome)
    }

    /// Resend one failed file by name. On failure the file is left unchanged.
    pub async fn resend_failed_file(&self, name: &str) -> Result<SendOutcome> {
        let entry = self.spool.get_failed_file(name).await?;
        self.resend_failed_entry(&entry).await
    }

    /// Resend every valid failed file, oldest first.
    pub async fn resend_all_failed(&self) -> Result<Vec<FailedResend>> {
        let entries = self.spool.list_failed_files().await?;
        let mut results = Vec::with_capacity(entries.len());

        for entry in entries {
            let result = self.resend_failed_entry(&entry).await;
            results.push(FailedResend {
                file_name: entry.file_name.clone(),
                record_count: entry.file.record_count(),
                result,
            });
        }
        Ok(results)
    }
}

impl SpoolFile {
    /// Whether this file has used up its resend attempts.
    pub fn at_ceiling(&self, max_retry_count: u32) -> bool {
        self.retry_count >= max_retry_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("abcdef123456"), "abcd****");
        assert_eq!(mask_token("abc"), "****");
        assert_eq!(mask_token(""), "****");
    }

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("  short  "), "short");
        let long = "x".repeat(600);
        let cut = truncate_body(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.len(), MAX_ERROR_BODY + 3);
    }

    #[test]
    fn test_outcome_is_delivered() {
        assert!(SendOutcome::Delivered { attempts: 1 }.is_delivered());
        assert!(SendOutcome::AlreadyRecorded { attempts: 1 }.is_delivered());
        assert!(
            !SendOutcome::Spooled {
                path: PathBuf::from("x"),
                attempts: 4,
                error: "e".into()
            }
            .is_delivered()
        );
    }
}
