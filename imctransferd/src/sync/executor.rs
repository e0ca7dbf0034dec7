use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::hash::{ContentHash, ContentHasher, HashKind};
use super::paths::{STAGING_SUFFIX, staging_path_for};
use super::remote::{RemoteError, RemoteStorage};
use super::store::Integrity;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("transfer failed: {0}")]
    TransferFailure(RemoteError),
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("size check failed: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("download cancelled")]
    Cancelled,
}

impl From<RemoteError> for DownloadError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Auth(message) => DownloadError::Auth(message),
            RemoteError::Cancelled => DownloadError::Cancelled,
            other => DownloadError::TransferFailure(other),
        }
    }
}

impl DownloadError {
    /// Whether another attempt in the same pass may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DownloadError::TransferFailure(err) => err.is_retryable(),
            DownloadError::IntegrityMismatch { .. }
            | DownloadError::SizeMismatch { .. }
            | DownloadError::Io(_) => true,
            DownloadError::Auth(_) | DownloadError::Cancelled => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DownloadError::TransferFailure(err) => err.retry_after(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub remote_id: String,
    pub expected_hash: Option<String>,
    pub expected_size: u64,
    pub final_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub hash: ContentHash,
    pub size: u64,
    pub final_path: PathBuf,
    pub integrity: Integrity,
}

/// Removes the staging file on drop unless the download was promoted.
struct StagingFile {
    path: PathBuf,
    armed: bool,
}

impl StagingFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = std::fs::remove_file(&self.path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %err, "failed to remove staging file");
                }
            }
        }
    }
}

pub struct DownloadExecutor {
    remote: Arc<dyn RemoteStorage>,
    staging_dir: PathBuf,
    hash_kind: HashKind,
}

impl DownloadExecutor {
    pub fn new(remote: Arc<dyn RemoteStorage>, staging_dir: PathBuf, hash_kind: HashKind) -> Self {
        Self {
            remote,
            staging_dir,
            hash_kind,
        }
    }

    /// Streams one remote file into staging, verifies it and renames it into
    /// place. Nothing is ever written at `final_path` before verification.
    pub async fn fetch(
        &self,
        request: &DownloadRequest,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            opened = self.remote.open_read(&request.remote_id) => opened?,
        };

        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let staging_path = staging_path_for(&self.staging_dir, &request.remote_id);
        let mut file = create_staging(&staging_path).await?;
        let mut staging = StagingFile::new(staging_path);
        let mut hasher = ContentHasher::new(self.hash_kind);
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let size = hasher.bytes_seen();
        let hash = hasher.finalize();
        let integrity = match request.expected_hash.as_deref() {
            Some(expected) => {
                if !hash.matches(expected) {
                    return Err(DownloadError::IntegrityMismatch {
                        expected: expected.to_ascii_lowercase(),
                        actual: hash.into_string(),
                    });
                }
                Integrity::HashVerified
            }
            None => {
                if size != request.expected_size {
                    return Err(DownloadError::SizeMismatch {
                        expected: request.expected_size,
                        actual: size,
                    });
                }
                Integrity::UnverifiedHeuristic
            }
        };

        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if let Some(parent) = request.final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&staging.path, &request.final_path).await?;
        staging.disarm();
        sync_parent_dir(&request.final_path).await;

        debug!(
            remote_id = %request.remote_id,
            path = %request.final_path.display(),
            size,
            hash = %hash,
            "download promoted"
        );
        Ok(DownloadOutcome {
            hash,
            size,
            final_path: request.final_path.clone(),
            integrity,
        })
    }

    /// Deletes leftover staging files older than `older_than`. Returns how
    /// many were removed.
    pub async fn sweep_stale_staging(&self, older_than: Duration) -> io::Result<usize> {
        let mut dir = match tokio::fs::read_dir(&self.staging_dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };
        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(STAGING_SUFFIX) {
                continue;
            }
            let metadata = entry.metadata().await?;
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age >= older_than {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Opens a staging file that did not exist before. A leftover from an
/// interrupted run is removed first; the caller holds the claim on the id.
async fn create_staging(path: &Path) -> io::Result<tokio::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    match options.open(path).await {
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            warn!(path = %path.display(), "removing leftover staging file");
            tokio::fs::remove_file(path).await?;
            options.open(path).await
        }
        other => other,
    }
}

async fn sync_parent_dir(path: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };
    // Not every platform can open a directory for syncing.
    if let Ok(dir) = tokio::fs::File::open(parent).await {
        if let Err(err) = dir.sync_all().await {
            debug!(path = %parent.display(), error = %err, "directory sync failed");
        }
    }
}
