use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::{Backoff, RetryPolicy};
use super::executor::{DownloadError, DownloadExecutor, DownloadRequest};
use super::hash::{HashKind, digest_file};
use super::paths::{Layout, local_path_for};
use super::planner::{PlanAction, PlanContext, PlanCounts, PlanReason, SyncPlanEntry, plan};
use super::remote::{RemoteError, RemoteFileDescriptor, RemoteListing, RemoteStorage};
use super::store::{Integrity, MetadataStore, PassSummary, StoreError, SyncRecord, SyncStatus};

/// Attempts for listing pages before a pass gives up on the listing.
const LISTING_ATTEMPTS: u32 = 4;
/// Re-reads allowed when a commit loses an optimistic-concurrency race.
const CONFLICT_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum PassError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("metadata store is corrupt: {0}")]
    StoreCorruption(String),
    #[error("metadata store error: {0}")]
    Store(StoreError),
    #[error("remote listing failed: {0}")]
    Listing(RemoteError),
}

impl From<StoreError> for PassError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corruption(message) => PassError::StoreCorruption(message),
            other => PassError::Store(other),
        }
    }
}

impl PassError {
    /// Errors after which the daemon must stop instead of waiting for the
    /// next pass.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PassError::Auth(_) | PassError::StoreCorruption(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalAudit {
    Off,
    /// File exists with the recorded size.
    #[default]
    Presence,
    /// Presence plus a full re-hash.
    Full,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub root_folder_id: String,
    pub file_extensions: Vec<String>,
    pub root_output_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub max_retry_attempts: u32,
    pub stale_download_threshold: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub pass_timeout: Option<Duration>,
    pub hash_kind: HashKind,
    pub layout: Layout,
    pub local_audit: LocalAudit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPhase {
    Listing,
    Diffing,
    Executing,
    Committing,
    Done,
}

impl PassPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassPhase::Listing => "listing",
            PassPhase::Diffing => "diffing",
            PassPhase::Executing => "executing",
            PassPhase::Committing => "committing",
            PassPhase::Done => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassFailure {
    pub remote_id: String,
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct PassReport {
    pub phase: PassPhase,
    /// Phase in which cancellation or the pass timeout hit, if any.
    pub interrupted_at: Option<PassPhase>,
    pub planned: PlanCounts,
    pub fetched: u64,
    pub skipped: u64,
    pub failed: u64,
    pub missing: u64,
    pub renamed: u64,
    pub abandoned: u64,
    pub newly_verified: Vec<SyncRecord>,
    pub failures: Vec<PassFailure>,
    pub partial: bool,
    pub started_at: i64,
    pub finished_at: i64,
}

impl PassReport {
    fn new(started_at: i64) -> Self {
        Self {
            phase: PassPhase::Listing,
            interrupted_at: None,
            planned: PlanCounts::default(),
            fetched: 0,
            skipped: 0,
            failed: 0,
            missing: 0,
            renamed: 0,
            abandoned: 0,
            newly_verified: Vec::new(),
            failures: Vec::new(),
            partial: false,
            started_at,
            finished_at: started_at,
        }
    }

    pub fn summary(&self) -> PassSummary {
        PassSummary {
            started_at: self.started_at,
            finished_at: self.finished_at,
            phase: self
                .interrupted_at
                .map_or(self.phase.as_str(), |phase| phase.as_str())
                .to_string(),
            partial: self.partial,
            fetched: self.fetched,
            skipped: self.skipped,
            failed: self.failed,
            missing: self.missing,
            renamed: self.renamed,
            failures: self
                .failures
                .iter()
                .map(|f| format!("{} ({}): {}", f.remote_id, f.path, f.reason))
                .collect(),
        }
    }
}

enum FileOutcome {
    Verified(SyncRecord),
    Failed(PassFailure),
    Abandoned,
    /// Someone else claimed the record after it was planned.
    InFlight,
    AuthRejected(String),
}

/// Aborts the pass timer when the pass ends first.
struct PassTimer(JoinHandle<()>);

impl Drop for PassTimer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct SyncOrchestrator {
    remote: Arc<dyn RemoteStorage>,
    store: Arc<MetadataStore>,
    executor: DownloadExecutor,
    settings: SyncSettings,
    retry: RetryPolicy,
}

impl SyncOrchestrator {
    pub fn new(
        remote: Arc<dyn RemoteStorage>,
        store: Arc<MetadataStore>,
        settings: SyncSettings,
    ) -> Self {
        let executor = DownloadExecutor::new(
            remote.clone(),
            settings.staging_dir.clone(),
            settings.hash_kind,
        );
        let retry = RetryPolicy::new(
            Backoff::new(settings.retry_base_delay, settings.retry_max_delay, true),
            settings.max_retry_attempts,
        );
        Self {
            remote,
            store,
            executor,
            settings,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// Runs one list, diff, execute, commit cycle.
    ///
    /// Cancellation and the pass timeout never fail the pass: in-flight
    /// downloads are abandoned (their records stay `downloading`) and the
    /// report comes back with `partial` set.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<PassReport, PassError> {
        let mut report = PassReport::new(now_unix());
        let pass_cancel = cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let _timer = self.settings.pass_timeout.map(|limit| {
            let token = pass_cancel.clone();
            let flag = timed_out.clone();
            PassTimer(tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                flag.store(true, Ordering::SeqCst);
                token.cancel();
            }))
        });

        info!(root = %self.settings.root_folder_id, "sync pass started");
        match self
            .executor
            .sweep_stale_staging(self.settings.stale_download_threshold)
            .await
        {
            Ok(0) => {}
            Ok(removed) => info!(removed, "removed stale staging files"),
            Err(err) => warn!(error = %err, "staging sweep failed"),
        }

        let Some(snapshot) = self.list(&pass_cancel).await? else {
            report.interrupted_at = Some(PassPhase::Listing);
            return Ok(self.finish(report, &timed_out).await);
        };

        report.phase = PassPhase::Diffing;
        let records: HashMap<String, SyncRecord> = self
            .store
            .list_all()
            .await?
            .into_iter()
            .map(|record| (record.remote_id.clone(), record))
            .collect();
        let damaged = self.audit_local(&records, &pass_cancel).await;
        let ctx = PlanContext {
            records: &records,
            damaged: &damaged,
            now: now_unix(),
            stale_after_secs: i64::try_from(self.settings.stale_download_threshold.as_secs())
                .unwrap_or(i64::MAX),
            max_attempts: self.settings.max_retry_attempts,
        };
        let entries = plan(&snapshot, &ctx);
        report.planned = PlanCounts::of(&entries);
        info!(
            listed = snapshot.len(),
            fetch_new = report.planned.fetch_new,
            refetch_changed = report.planned.refetch_changed,
            skip = report.planned.skip,
            mark_missing = report.planned.mark_missing,
            "sync plan ready"
        );

        let (downloads, metadata): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|entry| entry.action.downloads());

        report.phase = PassPhase::Executing;
        let auth_error = self
            .execute(downloads, &pass_cancel, &mut report)
            .await?;
        if let Some(message) = auth_error {
            error!(error = %message, "authentication rejected, aborting pass");
            report.interrupted_at = Some(PassPhase::Executing);
            self.finish(report, &timed_out).await;
            return Err(PassError::Auth(message));
        }
        if pass_cancel.is_cancelled() && report.interrupted_at.is_none() {
            report.interrupted_at = Some(PassPhase::Executing);
        }

        report.phase = PassPhase::Committing;
        for entry in &metadata {
            self.commit_metadata(entry, &mut report).await?;
        }

        Ok(self.finish(report, &timed_out).await)
    }

    async fn list(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<RemoteFileDescriptor>>, PassError> {
        let policy = RetryPolicy::new(
            Backoff::new(
                self.settings.retry_base_delay,
                self.settings.retry_max_delay,
                true,
            ),
            LISTING_ATTEMPTS,
        );
        let mut listing = RemoteListing::new(
            self.remote.as_ref(),
            &self.settings.root_folder_id,
            &self.settings.file_extensions,
            policy,
            cancel.clone(),
        );
        match listing.collect_all().await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(RemoteError::Cancelled) => {
                warn!("listing interrupted");
                Ok(None)
            }
            Err(RemoteError::Auth(message)) => Err(PassError::Auth(message)),
            Err(err) => Err(PassError::Listing(err)),
        }
    }

    async fn finish(&self, mut report: PassReport, timed_out: &AtomicBool) -> PassReport {
        report.phase = PassPhase::Done;
        report.partial = report.interrupted_at.is_some() || report.abandoned > 0;
        report.finished_at = now_unix();
        if timed_out.load(Ordering::SeqCst) {
            warn!("sync pass hit its timeout");
        }
        if let Err(err) = self.store.record_pass(&report.summary()).await {
            warn!(error = %err, "failed to record sync pass");
        }
        info!(
            fetched = report.fetched,
            skipped = report.skipped,
            failed = report.failed,
            missing = report.missing,
            renamed = report.renamed,
            abandoned = report.abandoned,
            partial = report.partial,
            "sync pass finished"
        );
        report
    }

    /// Verified records whose local copy no longer looks right.
    async fn audit_local(
        &self,
        records: &HashMap<String, SyncRecord>,
        cancel: &CancellationToken,
    ) -> HashSet<String> {
        let mut damaged = HashSet::new();
        if self.settings.local_audit == LocalAudit::Off {
            return damaged;
        }
        for record in records.values() {
            if cancel.is_cancelled() {
                break;
            }
            if record.status != SyncStatus::Verified {
                continue;
            }
            let Some(local) = record.local_path.as_deref() else {
                continue;
            };
            let ok = match tokio::fs::metadata(local).await {
                Ok(meta) if i64::try_from(meta.len()).is_ok_and(|len| len == record.size) => {
                    match (self.settings.local_audit, record.content_hash.as_deref()) {
                        (LocalAudit::Full, Some(expected)) => {
                            match digest_file(self.settings.hash_kind, local.as_ref()).await {
                                Ok(actual) => actual.matches(expected),
                                Err(err) => {
                                    warn!(remote_id = %record.remote_id, path = local, error = %err, "local re-hash failed");
                                    false
                                }
                            }
                        }
                        _ => true,
                    }
                }
                Ok(_) => false,
                Err(_) => false,
            };
            if !ok {
                warn!(remote_id = %record.remote_id, path = local, "local copy missing or damaged");
                damaged.insert(record.remote_id.clone());
            }
        }
        damaged
    }

    /// Runs the download entries on a bounded pool. Returns the auth error
    /// message if the remote rejected credentials.
    async fn execute(
        &self,
        downloads: Vec<SyncPlanEntry>,
        cancel: &CancellationToken,
        report: &mut PassReport,
    ) -> Result<Option<String>, PassError> {
        let workers = self.settings.max_concurrent_downloads.max(1);
        let mut results = stream::iter(downloads)
            .map(|entry| async move { self.download_one(entry, cancel).await })
            .buffer_unordered(workers);

        let mut auth_error = None;
        let mut store_error = None;
        while let Some(result) = results.next().await {
            match result {
                Ok(FileOutcome::Verified(record)) => {
                    report.fetched += 1;
                    report.newly_verified.push(record);
                }
                Ok(FileOutcome::Failed(failure)) => {
                    report.failed += 1;
                    report.failures.push(failure);
                }
                Ok(FileOutcome::Abandoned) => report.abandoned += 1,
                Ok(FileOutcome::InFlight) => report.skipped += 1,
                Ok(FileOutcome::AuthRejected(message)) => {
                    cancel.cancel();
                    auth_error.get_or_insert(message);
                }
                Err(err) => {
                    cancel.cancel();
                    store_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = store_error {
            return Err(err);
        }
        report.newly_verified.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        Ok(auth_error)
    }

    async fn download_one(
        &self,
        entry: SyncPlanEntry,
        cancel: &CancellationToken,
    ) -> Result<FileOutcome, PassError> {
        let Some(descriptor) = entry.descriptor else {
            return Ok(FileOutcome::Abandoned);
        };
        if cancel.is_cancelled() {
            return Ok(FileOutcome::Abandoned);
        }

        let final_path =
            match local_path_for(&self.settings.root_output_dir, &descriptor.path, self.settings.layout) {
                Ok(path) => path,
                Err(err) => {
                    let reason = err.to_string();
                    self.record_failure(&descriptor, &reason, true).await?;
                    return Ok(FileOutcome::Failed(failure(&descriptor, reason)));
                }
            };

        // Claim: mark downloading before any byte moves.
        let fresh_budget = entry.action == PlanAction::RefetchChanged;
        let Some(claimed) = self
            .claim(&descriptor, entry.expected_revision, fresh_budget)
            .await?
        else {
            debug!(
                remote_id = %descriptor.remote_id,
                "record changed since planning, leaving it to its current owner"
            );
            return Ok(FileOutcome::InFlight);
        };
        debug!(
            remote_id = %descriptor.remote_id,
            path = %descriptor.path,
            reason = %entry.reason,
            attempts = claimed.attempt_count,
            "download claimed"
        );

        let request = DownloadRequest {
            remote_id: descriptor.remote_id.clone(),
            expected_hash: descriptor.content_hash.clone(),
            expected_size: descriptor.size,
            final_path: final_path.clone(),
        };

        loop {
            match self.executor.fetch(&request, cancel).await {
                Ok(outcome) => {
                    let local_path = outcome.final_path.to_string_lossy().into_owned();
                    let committed = self
                        .commit_with_reread(
                            &descriptor.remote_id,
                            || SyncRecord::new(&descriptor.remote_id, &descriptor.path, 0),
                            |record| {
                                record.path = descriptor.path.clone();
                                record.content_hash = Some(outcome.hash.as_str().to_string());
                                record.size = to_i64(outcome.size);
                                record.remote_modified = descriptor.modified;
                                record.local_path = Some(local_path.clone());
                                record.status = SyncStatus::Verified;
                                record.integrity = Some(outcome.integrity);
                                record.attempt_count = 0;
                                record.last_error = None;
                                record.verified_at = Some(now_unix());
                                note_creation(record, &descriptor);
                            },
                        )
                        .await?;
                    info!(
                        remote_id = %committed.remote_id,
                        path = %committed.path,
                        local = %local_path,
                        integrity = outcome.integrity.as_str(),
                        "file verified"
                    );
                    return Ok(FileOutcome::Verified(committed));
                }
                Err(DownloadError::Cancelled) => {
                    debug!(remote_id = %descriptor.remote_id, "download abandoned");
                    return Ok(FileOutcome::Abandoned);
                }
                Err(DownloadError::Auth(message)) => {
                    // Not an attempt against the file; retry on the next pass.
                    self.commit_with_reread(
                        &descriptor.remote_id,
                        || SyncRecord::new(&descriptor.remote_id, &descriptor.path, 0),
                        |record| {
                            record.status = SyncStatus::Pending;
                            record.last_error = Some(message.clone());
                        },
                    )
                    .await?;
                    return Ok(FileOutcome::AuthRejected(message));
                }
                Err(err) => {
                    let reason = err.to_string();
                    let give_up = !err.is_transient();
                    let hint = err.retry_after();
                    let record = self.record_failure(&descriptor, &reason, give_up).await?;
                    let delay = if record.status == SyncStatus::Failed {
                        None
                    } else {
                        self.retry.delay_with_hint(record.attempt_count, hint)
                    };
                    let Some(delay) = delay else {
                        warn!(
                            remote_id = %descriptor.remote_id,
                            attempt = record.attempt_count,
                            error = %reason,
                            "download failed"
                        );
                        return Ok(FileOutcome::Failed(failure(&descriptor, reason)));
                    };
                    warn!(
                        remote_id = %descriptor.remote_id,
                        attempt = record.attempt_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "download failed, retrying"
                    );
                    if !RetryPolicy::wait(delay, cancel).await {
                        return Ok(FileOutcome::Abandoned);
                    }
                }
            }
        }
    }

    /// Marks the record `downloading` only if it is still at the revision the
    /// plan saw. `None` means another writer got there first.
    async fn claim(
        &self,
        descriptor: &RemoteFileDescriptor,
        expected_revision: i64,
        fresh_budget: bool,
    ) -> Result<Option<SyncRecord>, PassError> {
        let current = self.store.get(&descriptor.remote_id).await?;
        let mut record = match current {
            Some(record) if record.revision == expected_revision => record,
            None if expected_revision == 0 => {
                SyncRecord::new(&descriptor.remote_id, &descriptor.path, 0)
            }
            _ => return Ok(None),
        };
        record.path = descriptor.path.clone();
        record.content_hash = descriptor.content_hash.clone();
        record.size = to_i64(descriptor.size);
        record.remote_modified = descriptor.modified;
        record.status = SyncStatus::Downloading;
        record.integrity = None;
        record.last_attempt_at = Some(now_unix());
        if fresh_budget {
            record.attempt_count = 0;
        }
        note_creation(&mut record, descriptor);
        match self.store.upsert(&record).await {
            Ok(claimed) => Ok(Some(claimed)),
            Err(StoreError::ConcurrentWriteConflict { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Counts one attempt. The record stays `downloading` while the retry
    /// budget lasts and becomes `failed` once it is spent or `give_up` is set.
    async fn record_failure(
        &self,
        descriptor: &RemoteFileDescriptor,
        reason: &str,
        give_up: bool,
    ) -> Result<SyncRecord, PassError> {
        let max_attempts = self.settings.max_retry_attempts;
        self.commit_with_reread(
            &descriptor.remote_id,
            || {
                let mut record =
                    SyncRecord::new(&descriptor.remote_id, &descriptor.path, to_i64(descriptor.size));
                record.content_hash = descriptor.content_hash.clone();
                record.remote_modified = descriptor.modified;
                note_creation(&mut record, descriptor);
                record
            },
            |record| {
                record.attempt_count = record.attempt_count.saturating_add(1);
                record.last_attempt_at = Some(now_unix());
                record.last_error = Some(reason.to_string());
                record.status = if give_up || record.attempt_count >= max_attempts {
                    SyncStatus::Failed
                } else {
                    SyncStatus::Downloading
                };
            },
        )
        .await
    }

    async fn commit_metadata(
        &self,
        entry: &SyncPlanEntry,
        report: &mut PassReport,
    ) -> Result<(), PassError> {
        match entry.action {
            PlanAction::MarkMissing => {
                self.store.mark_missing(&entry.remote_id).await?;
                info!(remote_id = %entry.remote_id, "remote file removed, marked missing");
                report.missing += 1;
            }
            PlanAction::Skip => {
                report.skipped += 1;
                let restore = entry.reason == PlanReason::Reappeared;
                let upgrade = entry.reason == PlanReason::HashMatch;
                let creation = entry
                    .descriptor
                    .as_ref()
                    .and_then(|d| d.created.as_ref())
                    .filter(|_| entry.reason != PlanReason::InFlight);
                if entry.rename_to.is_none() && !restore && !upgrade && creation.is_none() {
                    return Ok(());
                }
                let Some(mut record) = self.store.get(&entry.remote_id).await? else {
                    return Ok(());
                };
                let mut changed = false;
                if let Some(new_path) = &entry.rename_to {
                    self.apply_rename(&mut record, new_path).await;
                    report.renamed += 1;
                    changed = true;
                }
                if restore {
                    info!(remote_id = %record.remote_id, path = %record.path, "remote file reappeared");
                    record.status = SyncStatus::Verified;
                    changed = true;
                }
                if upgrade && record.integrity == Some(Integrity::UnverifiedHeuristic) {
                    record.integrity = Some(Integrity::HashVerified);
                    changed = true;
                }
                if let Some(created) = creation {
                    if record.created_at != created.at || record.created_by != created.by {
                        record.created_at = created.at.clone();
                        record.created_by = created.by.clone();
                        changed = true;
                    }
                }
                if changed {
                    match self.store.upsert(&record).await {
                        Ok(_) => {}
                        Err(StoreError::ConcurrentWriteConflict { remote_id }) => {
                            // Picked up again by the next pass.
                            warn!(remote_id = %remote_id, "metadata update lost a write race");
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
            PlanAction::FetchNew | PlanAction::RefetchChanged => {}
        }
        Ok(())
    }

    async fn apply_rename(&self, record: &mut SyncRecord, new_path: &str) {
        info!(remote_id = %record.remote_id, from = %record.path, to = %new_path, "remote file renamed");
        record.path = new_path.to_string();

        let Some(old_local) = record.local_path.clone().map(PathBuf::from) else {
            return;
        };
        let new_local =
            match local_path_for(&self.settings.root_output_dir, new_path, self.settings.layout) {
                Ok(path) => path,
                Err(err) => {
                    warn!(remote_id = %record.remote_id, error = %err, "cannot map renamed path");
                    return;
                }
            };
        if new_local == old_local {
            return;
        }
        if let Some(parent) = new_local.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                warn!(path = %parent.display(), error = %err, "cannot create directory for renamed file");
                return;
            }
        }
        match tokio::fs::rename(&old_local, &new_local).await {
            Ok(()) => record.local_path = Some(new_local.to_string_lossy().into_owned()),
            Err(err) => warn!(
                remote_id = %record.remote_id,
                from = %old_local.display(),
                to = %new_local.display(),
                error = %err,
                "could not move renamed file"
            ),
        }
    }

    /// Reads the current record (or seeds one), applies `apply` and writes it
    /// back, re-reading after each lost optimistic-concurrency race.
    async fn commit_with_reread<S, F>(
        &self,
        remote_id: &str,
        seed: S,
        mut apply: F,
    ) -> Result<SyncRecord, PassError>
    where
        S: Fn() -> SyncRecord,
        F: FnMut(&mut SyncRecord),
    {
        let mut conflicts = 0;
        loop {
            let mut record = self.store.get(remote_id).await?.unwrap_or_else(&seed);
            apply(&mut record);
            match self.store.upsert(&record).await {
                Ok(committed) => return Ok(committed),
                Err(StoreError::ConcurrentWriteConflict { .. }) if conflicts < CONFLICT_RETRIES => {
                    conflicts += 1;
                    debug!(remote_id, conflicts, "write conflict, re-reading record");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn failure(descriptor: &RemoteFileDescriptor, reason: String) -> PassFailure {
    PassFailure {
        remote_id: descriptor.remote_id.clone(),
        path: descriptor.path.clone(),
        reason,
    }
}

fn note_creation(record: &mut SyncRecord, descriptor: &RemoteFileDescriptor) {
    if let Some(created) = &descriptor.created {
        record.created_at = created.at.clone();
        record.created_by = created.by.clone();
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
