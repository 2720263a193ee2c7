use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::error::{RemoteError, RemoteResult, Result, TransxError};
use crate::etag;
use crate::jobs::BackoffPolicy;
use crate::scan::{DirectoryScanner, FileKind, LocalFile};
use crate::storage::{ObjectHead, ObjectStore, s3_uri};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStatus {
    InSync,
    Uploaded,
    Failed,
}

/// Why a file could not be synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SyncFailure {
    /// The local file was missing or unreadable at transfer time
    LocalIo(String),
    /// The store refused or failed the request
    Remote(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRecord {
    pub file: LocalFile,
    pub key: String,
    pub status: SyncStatus,
    pub failure: Option<SyncFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub bucket: String,
    pub records: Vec<SyncRecord>,
}

impl SyncReport {
    /// `ok` when every file is in sync, `partial` otherwise.
    pub fn status(&self) -> &'static str {
        if self.failed().next().is_none() { "ok" } else { "partial" }
    }

    pub fn failed(&self) -> impl Iterator<Item = &SyncRecord> {
        self.records.iter().filter(|r| r.status == SyncStatus::Failed)
    }

    /// Media files whose remote copy now matches the local content.
    pub fn synced_media(&self) -> impl Iterator<Item = &SyncRecord> {
        self.records
            .iter()
            .filter(|r| r.file.kind == FileKind::Media && r.status != SyncStatus::Failed)
    }

    pub fn count(&self, status: SyncStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }
}

/// Deterministic object key for a scanned file.
pub fn object_key(identity: &str, file: &LocalFile) -> String {
    format!("{}/{}", identity, file.relative)
}

/// Metadata lookups per file before a transient failure is reported.
const HEAD_ATTEMPTS: u32 = 4;

/// Uploads files whose content differs from the remote copy.
pub struct SyncCoordinator {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    identity: String,
    bucket_ready: OnceCell<()>,
    show_progress: bool,
    head_attempts: u32,
    head_backoff: BackoffPolicy,
}

impl SyncCoordinator {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            identity: identity.into(),
            bucket_ready: OnceCell::new(),
            show_progress: false,
            head_attempts: HEAD_ATTEMPTS,
            head_backoff: BackoffPolicy::new(1.0, Duration::from_secs(1), Duration::from_secs(8)),
        }
    }

    /// Retry transient metadata lookups `attempts` times in total, waiting per `backoff`.
    pub fn with_head_retry(mut self, attempts: u32, backoff: BackoffPolicy) -> Self {
        self.head_attempts = attempts.max(1);
        self.head_backoff = backoff;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Make sure the destination bucket exists. Runs at most once per coordinator,
    /// concurrent callers wait for the first one.
    pub async fn ensure_bucket(&self) -> Result<()> {
        self.bucket_ready
            .get_or_try_init(|| async {
                match self.store.head_bucket(&self.bucket).await {
                    Ok(()) => {
                        info!("Bucket '{}' exists", self.bucket);
                        Ok(())
                    }
                    Err(RemoteError::NotFound(_)) => {
                        info!("Bucket '{}' does not exist, creating it", self.bucket);
                        match self.store.create_bucket(&self.bucket).await {
                            Ok(()) | Err(RemoteError::Conflict(_)) => Ok(()),
                            Err(e) => Err(TransxError::Setup(format!(
                                "cannot create bucket '{}': {}",
                                self.bucket, e
                            ))),
                        }
                    }
                    Err(e) => Err(TransxError::Setup(format!(
                        "cannot access bucket '{}': {}",
                        self.bucket, e
                    ))),
                }
            })
            .await
            .map(|_| ())
    }

    /// Scan `directory` and sync every file found.
    pub async fn sync<P: AsRef<Path>>(&self, scanner: &DirectoryScanner, directory: P) -> Result<SyncReport> {
        let files = scanner.scan(directory)?;
        self.sync_files(files).await
    }

    /// Sync an existing scan snapshot. Per-file failures are recorded, not returned.
    pub async fn sync_files(&self, files: Vec<LocalFile>) -> Result<SyncReport> {
        self.ensure_bucket().await?;

        let progress = if self.show_progress {
            let pb = ProgressBar::new(files.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}") {
                pb.set_style(style.progress_chars("#>-"));
            }
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut records = Vec::with_capacity(files.len());
        for file in files {
            progress.set_message(file.relative.clone());
            records.push(self.sync_file(file).await);
            progress.inc(1);
        }
        progress.finish_and_clear();

        let report = SyncReport {
            bucket: self.bucket.clone(),
            records,
        };
        info!(
            "Sync finished: {} in sync, {} uploaded, {} failed",
            report.count(SyncStatus::InSync),
            report.count(SyncStatus::Uploaded),
            report.count(SyncStatus::Failed)
        );
        Ok(report)
    }

    /// Skip or upload a single file.
    pub async fn sync_file(&self, file: LocalFile) -> SyncRecord {
        let key = object_key(&self.identity, &file);
        let uri = s3_uri(&self.bucket, &key);

        let outcome = self.decide_and_transfer(&file, &key).await;
        match &outcome {
            Ok(SyncStatus::InSync) => info!("File {} in sync with {}", file.path.display(), uri),
            Ok(_) => info!("File {} uploaded to {}", file.path.display(), uri),
            Err(failure) => error!("File {} sync failed to {}: {:?}", file.path.display(), uri, failure),
        }

        match outcome {
            Ok(status) => SyncRecord { file, key, status, failure: None },
            Err(failure) => SyncRecord {
                file,
                key,
                status: SyncStatus::Failed,
                failure: Some(failure),
            },
        }
    }

    async fn decide_and_transfer(&self, file: &LocalFile, key: &str) -> std::result::Result<SyncStatus, SyncFailure> {
        // The scan snapshot may be stale by now
        tokio::fs::File::open(&file.path)
            .await
            .map_err(|e| SyncFailure::LocalIo(e.to_string()))?;

        match self.head_with_retry(key).await {
            Ok(head) => {
                if self.content_matches(file, &head.etag).await? {
                    return Ok(SyncStatus::InSync);
                }
                debug!("Remote ETag {} differs from {}", head.etag, file.path.display());
            }
            Err(RemoteError::NotFound(_)) => debug!("Key not found {}", key),
            Err(e) => return Err(SyncFailure::Remote(format!("cannot inspect {}: {}", key, e))),
        }

        self.store
            .put_object(&self.bucket, key, &file.path)
            .await
            .map(|_| SyncStatus::Uploaded)
            .map_err(|e| SyncFailure::Remote(e.to_string()))
    }

    /// HEAD with bounded retry of transient errors; other answers are returned as is.
    async fn head_with_retry(&self, key: &str) -> RemoteResult<ObjectHead> {
        let mut attempt = 0;
        loop {
            match self.store.head_object(&self.bucket, key).await {
                Err(e) if e.is_transient() && attempt + 1 < self.head_attempts => {
                    let wait = self.head_backoff.wait(attempt);
                    warn!("Cannot inspect {} (attempt {}), retrying in {:?}: {}", key, attempt + 1, wait, e);
                    attempt += 1;
                    tokio::time::sleep(wait).await;
                }
                other => return other,
            }
        }
    }

    async fn content_matches(&self, file: &LocalFile, remote_etag: &str) -> std::result::Result<bool, SyncFailure> {
        let path = file.path.clone();
        let size = file.size;
        let remote_etag = remote_etag.to_string();
        tokio::task::spawn_blocking(move || etag::matches(&path, size, &remote_etag))
            .await
            .map_err(|e| SyncFailure::LocalIo(e.to_string()))?
            .map_err(|e| SyncFailure::LocalIo(e.to_string()))
    }
}
