//! Durable on-disk holding area for undelivered batches.
//!
//! ## Layout
//!
//! ```text
//! <spool_dir>/
//!   spool_20251201T101500123Z_<batch-key>.json   # waiting for resend
//! <failed_dir>/
//!   spool_20251201T101500123Z_<batch-key>.json   # retry ceiling reached
//! ```
//!
//! Files are JSON objects with `batchIdempotencyKey`, `records`,
//! `firstAttempt`, `retryCount` and `lastError`. Every write goes through a
//! temp file, fsync and rename, with owner-only permissions.
//!
//! One process owns these directories. There is no locking.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use exporter_core::log_spool_event;
use exporter_core::types::{self, Timestamp, parse_instant};
use exporter_transform::UsageWireRecord;
use exporter_transform::wire::deserialize_records;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use validator::{Validate, ValidationError};

use crate::error::{SpoolError, SpoolResult};
use crate::fsync;
use crate::notify::{LogNotifier, Notifier, QuarantineEvent};

/// File name prefix for spooled batches.
pub const SPOOL_FILE_PREFIX: &str = "spool_";

/// One undelivered batch as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SpoolFile {
    #[validate(custom(function = "validate_key_field"))]
    pub batch_idempotency_key: String,

    #[serde(deserialize_with = "deserialize_records")]
    #[validate(length(min = 1), nested)]
    pub records: Vec<UsageWireRecord>,

    /// Time of the original send attempt; never changes
    #[validate(custom(function = "validate_instant_field"))]
    pub first_attempt: String,

    /// Failed resends so far
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub last_error: String,
}

impl SpoolFile {
    pub fn new(
        batch_idempotency_key: impl Into<String>,
        records: Vec<UsageWireRecord>,
        first_attempt: Timestamp,
        last_error: impl Into<String>,
    ) -> Self {
        Self {
            batch_idempotency_key: batch_idempotency_key.into(),
            records,
            first_attempt: types::format_instant(&first_attempt),
            retry_count: 0,
            last_error: last_error.into(),
        }
    }

    pub fn first_attempt_at(&self) -> Option<Timestamp> {
        parse_instant(&self.first_attempt)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

/// A parsed spool or failed file together with where it lives.
#[derive(Debug, Clone, PartialEq)]
pub struct SpoolEntry {
    pub file_name: String,
    pub path: PathBuf,
    pub file: SpoolFile,
}

/// Check that a batch key is safe to embed in a file name.
pub fn validate_spool_key(key: &str) -> SpoolResult<()> {
    let safe = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if safe {
        Ok(())
    } else {
        Err(SpoolError::InvalidKey(key.to_string()))
    }
}

/// Check that an operator-supplied file name stays inside its directory.
pub fn validate_file_name(name: &str) -> SpoolResult<()> {
    let unsafe_name = name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || !name.ends_with(".json");
    if unsafe_name {
        Err(SpoolError::InvalidKey(name.to_string()))
    } else {
        Ok(())
    }
}

fn validate_key_field(key: &str) -> Result<(), ValidationError> {
    validate_spool_key(key).map_err(|_| ValidationError::new("batch_idempotency_key"))
}

fn validate_instant_field(value: &str) -> Result<(), ValidationError> {
    parse_instant(value)
        .map(|_| ())
        .ok_or_else(|| ValidationError::new("first_attempt"))
}

/// `spool_{UTC timestamp}_{key}.json`
pub fn spool_file_name(key: &str, at: Timestamp) -> String {
    format!("{SPOOL_FILE_PREFIX}{}_{key}.json", at.format("%Y%m%dT%H%M%S%3fZ"))
}

fn is_spool_file_for(name: &str, key: &str) -> bool {
    name.starts_with(SPOOL_FILE_PREFIX) && name.ends_with(&format!("_{key}.json"))
}

async fn blocking<T, F>(operation: &'static str, path: PathBuf, f: F) -> SpoolResult<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(|e| SpoolError::io(operation, path, e)),
        Err(join) => Err(SpoolError::io(operation, path, io::Error::other(join.to_string()))),
    }
}

/// Read and schema-check one file.
async fn read_spool_file(path: &Path) -> SpoolResult<SpoolFile> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            SpoolError::NotFound(path.display().to_string())
        } else {
            SpoolError::io("reading", path, e)
        }
    })?;

    let file: SpoolFile = serde_json::from_slice(&bytes).map_err(|e| SpoolError::Corrupted {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    file.validate().map_err(|e| SpoolError::Corrupted {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    Ok(file)
}

/// Owns the spool and failed directories.
#[derive(Clone)]
pub struct SpoolManager {
    spool_dir: PathBuf,
    failed_dir: PathBuf,
    notifier: Arc<dyn Notifier>,
    /// Notification tasks not yet joined; shared between clones
    notifications: Arc<Mutex<JoinSet<()>>>,
}

impl std::fmt::Debug for SpoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpoolManager")
            .field("spool_dir", &self.spool_dir)
            .field("failed_dir", &self.failed_dir)
            .finish_non_exhaustive()
    }
}

impl SpoolManager {
    /// Create a manager that reports quarantines through [`LogNotifier`].
    pub fn new(spool_dir: impl Into<PathBuf>, failed_dir: impl Into<PathBuf>) -> Self {
        Self {
            spool_dir: spool_dir.into(),
            failed_dir: failed_dir.into(),
            notifier: Arc::new(LogNotifier),
            notifications: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Replace the quarantine notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    pub fn failed_dir(&self) -> &Path {
        &self.failed_dir
    }

    async fn write_file(&self, dir: &Path, file_name: String, file: &SpoolFile) -> SpoolResult<PathBuf> {
        let target = dir.join(&file_name);
        let bytes = serde_json::to_vec_pretty(file).map_err(|e| SpoolError::Json {
            path: target.clone(),
            source: e,
        })?;
        let dir = dir.to_path_buf();
        blocking("writing", target, move || fsync::write_atomic(&dir, &file_name, &bytes)).await
    }

    async fn remove_file(&self, path: &Path) -> SpoolResult<()> {
        let owned = path.to_path_buf();
        blocking("removing", path.to_path_buf(), move || fsync::remove_durable(&owned)).await
    }

    /// Names and paths of `*.json` files in `dir`. A missing directory is empty.
    async fn scan(&self, dir: &Path) -> SpoolResult<Vec<(String, PathBuf)>> {
        let mut read_dir = match tokio::fs::read_dir(dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SpoolError::io("listing", dir, e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| SpoolError::io("listing", dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                files.push((name, entry.path()));
            }
        }
        Ok(files)
    }

    async fn find_spool_paths(&self, key: &str) -> SpoolResult<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = self
            .scan(&self.spool_dir)
            .await?
            .into_iter()
            .filter(|(name, _)| is_spool_file_for(name, key))
            .map(|(_, path)| path)
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Durably store a batch that could not be delivered.
    ///
    /// A batch already spooled under the same key is replaced, keeping its
    /// `firstAttempt` and `retryCount`.
    pub async fn save_to_spool(
        &self,
        key: &str,
        records: &[UsageWireRecord],
        first_attempt: Timestamp,
        last_error: &str,
    ) -> SpoolResult<PathBuf> {
        validate_spool_key(key)?;

        let mut file = SpoolFile::new(key, records.to_vec(), first_attempt, last_error);
        let existing = self.find_spool_paths(key).await?;
        if let Some(previous) = existing.first()
            && let Ok(previous) = read_spool_file(previous).await
        {
            file.first_attempt = previous.first_attempt;
            file.retry_count = previous.retry_count;
        }

        let path = self
            .write_file(&self.spool_dir, spool_file_name(key, types::now()), &file)
            .await?;
        for old in existing.iter().filter(|p| **p != path) {
            self.remove_file(old).await?;
        }

        log_spool_event!(
            "spooled",
            batch_key = %key,
            records = file.records.len(),
            path = %path.display()
        );
        Ok(path)
    }

    async fn list(&self, dir: &Path, quarantine_corrupted: bool) -> SpoolResult<Vec<SpoolEntry>> {
        let mut entries = Vec::new();

        for (file_name, path) in self.scan(dir).await? {
            match read_spool_file(&path).await {
                Ok(file) => entries.push(SpoolEntry {
                    file_name,
                    path,
                    file,
                }),
                Err(SpoolError::Corrupted { reason, .. }) => {
                    warn!(file = %file_name, %reason, "corrupted spool file");
                    if quarantine_corrupted {
                        self.quarantine_corrupted(&path).await;
                    }
                }
                Err(e) => warn!(file = %file_name, error = %e, "skipping unreadable spool file"),
            }
        }

        entries.sort_by(|a, b| {
            a.file
                .first_attempt_at()
                .cmp(&b.file.first_attempt_at())
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
        Ok(entries)
    }

    async fn quarantine_corrupted(&self, path: &Path) {
        let src = path.to_path_buf();
        let dest = self.failed_dir.clone();
        match blocking("quarantining", path.to_path_buf(), move || fsync::move_into(&src, &dest)).await
        {
            Ok(target) => log_spool_event!(
                "corrupted_quarantined",
                from = %path.display(),
                to = %target.display()
            ),
            Err(e) => warn!(error = %e, "failed to move corrupted spool file"),
        }
    }

    /// Valid spool files, oldest `firstAttempt` first.
    ///
    /// Corrupted files are moved to the failed directory.
    pub async fn list_spool_files(&self) -> SpoolResult<Vec<SpoolEntry>> {
        self.list(&self.spool_dir, true).await
    }

    /// Valid failed files, oldest `firstAttempt` first. Corrupted ones are skipped.
    pub async fn list_failed_files(&self) -> SpoolResult<Vec<SpoolEntry>> {
        self.list(&self.failed_dir, false).await
    }

    /// Rewrite a spooled batch after a failed resend.
    ///
    /// The old file is deleted before the new one is written.
    pub async fn update_spool_file(&self, file: &SpoolFile) -> SpoolResult<PathBuf> {
        validate_spool_key(&file.batch_idempotency_key)?;

        let existing = self.find_spool_paths(&file.batch_idempotency_key).await?;
        if existing.is_empty() {
            return Err(SpoolError::NotFound(file.batch_idempotency_key.clone()));
        }
        for path in &existing {
            self.remove_file(path).await?;
        }

        let path = self
            .write_file(
                &self.spool_dir,
                spool_file_name(&file.batch_idempotency_key, types::now()),
                file,
            )
            .await?;

        debug!(
            batch_key = %file.batch_idempotency_key,
            retry_count = file.retry_count,
            "updated spool file"
        );
        Ok(path)
    }

    /// Move a batch to the failed directory and fire a notification.
    ///
    /// The notification runs on a background task; its failure is only
    /// logged. Call [`SpoolManager::flush_notifications`] before exiting.
    pub async fn move_to_failed(&self, file: &SpoolFile) -> SpoolResult<PathBuf> {
        let key = &file.batch_idempotency_key;
        validate_spool_key(key)?;

        let existing = self.find_spool_paths(key).await?;
        let file_name = existing
            .first()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| spool_file_name(key, types::now()));

        let failed_path = self.write_file(&self.failed_dir, file_name.clone(), file).await?;
        for path in &existing {
            self.remove_file(path).await?;
        }

        log_spool_event!(
            "quarantined",
            batch_key = %key,
            file = %file_name,
            retry_count = file.retry_count
        );

        self.notify_quarantined(QuarantineEvent {
            batch_idempotency_key: key.clone(),
            file_name,
            record_count: file.records.len(),
            first_attempt: file.first_attempt.clone(),
            retry_count: file.retry_count,
            last_error: file.last_error.clone(),
        });

        Ok(failed_path)
    }

    fn notify_quarantined(&self, event: QuarantineEvent) {
        let notifier = Arc::clone(&self.notifier);
        let mut tasks = self
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if let Err(e) = notifier.notify(&event).await {
                warn!(
                    batch_key = %event.batch_idempotency_key,
                    error = %e,
                    "quarantine notification failed"
                );
            }
        });
    }

    /// Wait up to `timeout` for pending quarantine notifications.
    ///
    /// Whatever is still running at the deadline is aborted and logged.
    /// Returns how many notifications completed.
    pub async fn flush_notifications(&self, timeout: Duration) -> usize {
        let mut tasks = std::mem::take(
            &mut *self
                .notifications
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if tasks.is_empty() {
            return 0;
        }

        let mut completed = 0;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(()) => completed += 1,
                    Err(e) => warn!(error = %e, "quarantine notification task failed"),
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                pending = tasks.len(),
                ?timeout,
                "abandoning quarantine notifications still in flight"
            );
            tasks.shutdown().await;
        }
        completed
    }

    /// Delete every spool file for `key`. Returns whether any existed.
    pub async fn delete_spool_file(&self, key: &str) -> SpoolResult<bool> {
        validate_spool_key(key)?;

        let existing = self.find_spool_paths(key).await?;
        for path in &existing {
            self.remove_file(path).await?;
        }
        if !existing.is_empty() {
            log_spool_event!("deleted", batch_key = %key);
        }
        Ok(!existing.is_empty())
    }

    /// Read a failed file by its name in the failed directory.
    pub async fn get_failed_file(&self, name: &str) -> SpoolResult<SpoolEntry> {
        validate_file_name(name)?;
        let path = self.failed_dir.join(name);
        let file = read_spool_file(&path).await.map_err(|e| match e {
            SpoolError::NotFound(_) => SpoolError::NotFound(name.to_string()),
            other => other,
        })?;

        Ok(SpoolEntry {
            file_name: name.to_string(),
            path,
            file,
        })
    }

    /// Delete a failed file by name.
    pub async fn delete_failed_file(&self, name: &str) -> SpoolResult<()> {
        validate_file_name(name)?;
        let path = self.failed_dir.join(name);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(SpoolError::NotFound(name.to_string()));
        }
        self.remove_file(&path).await?;
        log_spool_event!("failed_deleted", file = %name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyError;
    use async_trait::async_trait;
    use exporter_transform::wire::{
        AGGREGATION_METHOD, CURRENCY, SOURCE_SYSTEM, WireRecordMetadata,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn record(date: &str) -> UsageWireRecord {
        UsageWireRecord {
            usage_date: date.to_string(),
            provider: "aws".to_string(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
            request_count: 1,
            cost_actual: 0.018,
            currency: CURRENCY.to_string(),
            metadata: WireRecordMetadata {
                source_system: SOURCE_SYSTEM.to_string(),
                source_event_id: format!("dify-{date}-aws-claude-000000000000"),
                source_app_id: Some("app-1".to_string()),
                source_app_name: None,
                aggregation_method: AGGREGATION_METHOD.to_string(),
                time_range: None,
            },
        }
    }

    fn at(s: &str) -> Timestamp {
        parse_instant(s).unwrap()
    }

    fn manager(dir: &tempfile::TempDir) -> SpoolManager {
        SpoolManager::new(dir.path().join("spool"), dir.path().join("failed"))
    }

    struct ChannelNotifier(mpsc::UnboundedSender<QuarantineEvent>);

    #[async_trait]
    impl Notifier for ChannelNotifier {
        async fn notify(&self, event: &QuarantineEvent) -> Result<(), NotifyError> {
            let _ = self.0.send(event.clone());
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _event: &QuarantineEvent) -> Result<(), NotifyError> {
            Err(NotifyError::Status(500))
        }
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_spool_key("3fa9c0de").is_ok());
        assert!(validate_spool_key("").is_err());
        assert!(validate_spool_key("../etc").is_err());
        assert!(validate_spool_key("a/b").is_err());
    }

    #[test]
    fn test_file_name_validation() {
        assert!(validate_file_name("spool_20251201T000000000Z_abc.json").is_ok());
        assert!(validate_file_name("../secrets.json").is_err());
        assert!(validate_file_name(".hidden.json").is_err());
        assert!(validate_file_name("notes.txt").is_err());
    }

    #[tokio::test]
    async fn test_save_then_list_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let spool = manager(&dir);
        let records = vec![record("2025-12-01"), record("2025-12-02")];

        let path = spool
            .save_to_spool("abc123", &records, at("2025-12-01T10:00:00.000Z"), "HTTP 503: down")
            .await
            .unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("spool_") && name.ends_with("_abc123.json"));

        let listed = spool.list_spool_files().await.unwrap();
        assert_eq!(listed.len(), 1);
        let file = &listed[0].file;
        assert_eq!(file.batch_idempotency_key, "abc123");
        assert_eq!(file.records, records);
        assert_eq!(file.first_attempt, "2025-12-01T10:00:00.000Z");
        assert_eq!(file.retry_count, 0);
        assert_eq!(file.last_error, "HTTP 503: down");
    }

    #[tokio::test]
    async fn test_on_disk_format_is_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let spool = manager(&dir);
        let path = spool
            .save_to_spool("abc", &[record("2025-12-01")], at("2025-12-01T00:00:00.000Z"), "x")
            .await
            .unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        for field in ["batchIdempotencyKey", "records", "firstAttempt", "retryCount", "lastError"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
    }

    #[tokio::test]
    async fn test_update_preserves_first_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let spool = manager(&dir);
        spool
            .save_to_spool("abc", &[record("2025-12-01")], at("2025-12-01T10:00:00.000Z"), "first")
            .await
            .unwrap();

        let mut file = spool.list_spool_files().await.unwrap().remove(0).file;
        file.retry_count += 1;
        file.last_error = "second".to_string();
        spool.update_spool_file(&file).await.unwrap();

        let listed = spool.list_spool_files().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file.first_attempt, "2025-12-01T10:00:00.000Z");
        assert_eq!(listed[0].file.retry_count, 1);
        assert_eq!(listed[0].file.last_error, "second");
        assert_eq!(listed[0].file.records, file.records);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let spool = manager(&dir);
        let file = SpoolFile::new("nope", vec![record("2025-12-01")], types::now(), "");
        assert!(matches!(
            spool.update_spool_file(&file).await,
            Err(SpoolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_sorted_by_first_attempt_not_name() {
        let dir = tempfile::tempdir().unwrap();
        let spool = manager(&dir);

        // Written first, so its file name sorts first, but it is the newest.
        spool
            .save_to_spool("newest", &[record("2025-12-03")], at("2025-12-03T00:00:00.000Z"), "")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        spool
            .save_to_spool("oldest", &[record("2025-12-01")], at("2025-12-01T00:00:00.000Z"), "")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        spool
            .save_to_spool("middle", &[record("2025-12-02")], at("2025-12-02T00:00:00.000Z"), "")
            .await
            .unwrap();

        let keys: Vec<_> = spool
            .list_spool_files()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.file.batch_idempotency_key)
            .collect();
        assert_eq!(keys, vec!["oldest", "middle", "newest"]);
    }

    #[tokio::test]
    async fn test_resave_same_key_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let spool = manager(&dir);
        spool
            .save_to_spool("abc", &[record("2025-12-01")], at("2025-12-01T00:00:00.000Z"), "a")
            .await
            .unwrap();
        let mut file = spool.list_spool_files().await.unwrap().remove(0).file;
        file.retry_count = 4;
        spool.update_spool_file(&file).await.unwrap();

        spool
            .save_to_spool("abc", &[record("2025-12-01")], at("2025-12-05T00:00:00.000Z"), "b")
            .await
            .unwrap();

        let listed = spool.list_spool_files().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file.first_attempt, "2025-12-01T00:00:00.000Z");
        assert_eq!(listed[0].file.retry_count, 4);
        assert_eq!(listed[0].file.last_error, "b");
    }

    #[tokio::test]
    async fn test_corrupted_spool_file_moves_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let spool = manager(&dir);
        spool
            .save_to_spool("good", &[record("2025-12-01")], types::now(), "")
            .await
            .unwrap();

        std::fs::write(spool.spool_dir().join("spool_x_broken.json"), b"{not json").unwrap();
        std::fs::write(
            spool.spool_dir().join("spool_y_invalid.json"),
            br#"{"batchIdempotencyKey":"k","records":[],"firstAttempt":"2025-12-01T00:00:00.000Z","retryCount":0,"lastError":""}"#,
        )
        .unwrap();

        let listed = spool.list_spool_files().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file.batch_idempotency_key, "good");

        assert!(!spool.spool_dir().join("spool_x_broken.json").exists());
        assert!(spool.failed_dir().join("spool_x_broken.json").exists());
        assert!(spool.failed_dir().join("spool_y_invalid.json").exists());

        // Corrupted failed files are skipped, not moved again
        assert!(spool.list_failed_files().await.unwrap().is_empty());
        assert!(spool.failed_dir().join("spool_x_broken.json").exists());
    }

    #[tokio::test]
    async fn test_overflowing_token_counts_move_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let spool = manager(&dir);
        let mut overflowing = record("2025-12-01");
        overflowing.input_tokens = i64::MAX;
        overflowing.output_tokens = 1;
        overflowing.total_tokens = i64::MAX;
        let file = SpoolFile::new("overflow", vec![overflowing], at("2025-12-01T00:00:00.000Z"), "");

        std::fs::create_dir_all(spool.spool_dir()).unwrap();
        let name = "spool_20251201T000000000Z_overflow.json";
        std::fs::write(spool.spool_dir().join(name), serde_json::to_vec(&file).unwrap()).unwrap();

        assert!(spool.list_spool_files().await.unwrap().is_empty());
        assert!(!spool.spool_dir().join(name).exists());
        assert!(spool.failed_dir().join(name).exists());
    }

    #[tokio::test]
    async fn test_move_to_failed_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let spool = manager(&dir).with_notifier(Arc::new(ChannelNotifier(tx)));

        spool
            .save_to_spool("abc", &[record("2025-12-01")], at("2025-12-01T00:00:00.000Z"), "")
            .await
            .unwrap();
        let mut file = spool.list_spool_files().await.unwrap().remove(0).file;
        file.retry_count = 10;
        file.last_error = "HTTP 503: down".to_string();

        spool.move_to_failed(&file).await.unwrap();

        assert!(spool.list_spool_files().await.unwrap().is_empty());
        let failed = spool.list_failed_files().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].file.retry_count, 10);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.batch_idempotency_key, "abc");
        assert_eq!(event.file_name, failed[0].file_name);
        assert_eq!(event.record_count, 1);
    }

    struct SlowNotifier(Arc<std::sync::atomic::AtomicUsize>, Duration);

    #[async_trait]
    impl Notifier for SlowNotifier {
        async fn notify(&self, _event: &QuarantineEvent) -> Result<(), NotifyError> {
            tokio::time::sleep(self.1).await;
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_flush_waits_for_pending_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let sent = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let notifier = SlowNotifier(sent.clone(), Duration::from_millis(300));
        let spool = manager(&dir).with_notifier(Arc::new(notifier));

        for key in ["a", "b"] {
            let file = SpoolFile::new(key, vec![record("2025-12-01")], types::now(), "boom");
            spool.move_to_failed(&file).await.unwrap();
        }
        assert_eq!(sent.load(std::sync::atomic::Ordering::SeqCst), 0);

        // A clone shares the pending set
        let completed = spool.clone().flush_notifications(Duration::from_secs(5)).await;
        assert_eq!(completed, 2);
        assert_eq!(sent.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(spool.flush_notifications(Duration::from_secs(5)).await, 0);
    }

    #[tokio::test]
    async fn test_flush_gives_up_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let sent = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let notifier = SlowNotifier(sent.clone(), Duration::from_secs(30));
        let spool = manager(&dir).with_notifier(Arc::new(notifier));
        let file = SpoolFile::new("abc", vec![record("2025-12-01")], types::now(), "boom");
        spool.move_to_failed(&file).await.unwrap();

        let completed = spool.flush_notifications(Duration::from_millis(50)).await;
        assert_eq!(completed, 0);
        assert_eq!(sent.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_block_move() {
        let dir = tempfile::tempdir().unwrap();
        let spool = manager(&dir).with_notifier(Arc::new(FailingNotifier));
        let file = SpoolFile::new("abc", vec![record("2025-12-01")], types::now(), "boom");

        let path = spool.move_to_failed(&file).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_failed_file_get_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let spool = manager(&dir);
        let file = SpoolFile::new("abc", vec![record("2025-12-01")], types::now(), "boom");
        let path = spool.move_to_failed(&file).await.unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();

        let entry = spool.get_failed_file(&name).await.unwrap();
        assert_eq!(entry.file, file);

        spool.delete_failed_file(&name).await.unwrap();
        assert!(matches!(
            spool.get_failed_file(&name).await,
            Err(SpoolError::NotFound(_))
        ));
        assert!(matches!(
            spool.delete_failed_file(&name).await,
            Err(SpoolError::NotFound(_))
        ));
        assert!(matches!(
            spool.get_failed_file("../spool/x.json").await,
            Err(SpoolError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_spool_file() {
        let dir = tempfile::tempdir().unwrap();
        let spool = manager(&dir);
        spool
            .save_to_spool("abc", &[record("2025-12-01")], types::now(), "")
            .await
            .unwrap();

        assert!(spool.delete_spool_file("abc").await.unwrap());
        assert!(!spool.delete_spool_file("abc").await.unwrap());
        assert!(spool.list_spool_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_directories_list_empty() {
        let dir = tempfile::tempdir().unwrap();
        let spool = manager(&dir);
        assert!(spool.list_spool_files().await.unwrap().is_empty());
        assert!(spool.list_failed_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_legacy_spool_file_is_upgraded() {
        let dir = tempfile::tempdir().unwrap();
        let spool = manager(&dir);
        std::fs::create_dir_all(spool.spool_dir()).unwrap();
        std::fs::write(
            spool.spool_dir().join("spool_20251130T000000000Z_legacy.json"),
            serde_json::to_vec(&serde_json::json!({
                "batchIdempotencyKey": "legacy",
                "records": [{
                    "date": "2025-11-30",
                    "app_id": "app-7",
                    "provider": "aws-bedrock",
                    "model": "claude-3-5-sonnet",
                    "input_tokens": 1,
                    "output_tokens": 2,
                    "total_tokens": 3,
                    "cost_actual": 0.1,
                    "currency": "USD"
                }],
                "firstAttempt": "2025-11-30T00:00:00.000Z",
                "retryCount": 2,
                "lastError": "timeout"
            }))
            .unwrap(),
        )
        .unwrap();

        let listed = spool.list_spool_files().await.unwrap();
        assert_eq!(listed.len(), 1);
        let record = &listed[0].file.records[0];
        assert_eq!(record.usage_date, "2025-11-30");
        assert_eq!(record.provider, "aws");
        assert_eq!(record.model, "claude-3-5-sonnet-20241022");
    }
}
