use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use tracing::warn;

use super::hash::hashes_equal;
use super::remote::RemoteFileDescriptor;
use super::store::{SyncRecord, SyncStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanAction {
    FetchNew,
    RefetchChanged,
    Skip,
    MarkMissing,
}

impl PlanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanAction::FetchNew => "fetch-new",
            PlanAction::RefetchChanged => "refetch-changed",
            PlanAction::Skip => "skip",
            PlanAction::MarkMissing => "mark-missing",
        }
    }

    pub fn downloads(&self) -> bool {
        matches!(self, PlanAction::FetchNew | PlanAction::RefetchChanged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanReason {
    NotSeenBefore,
    Pending,
    RetryFailed,
    StaleDownload,
    ContentChanged,
    LocalCopyDamaged,
    HashMatch,
    HeuristicMatch,
    InFlight,
    AttemptCapReached,
    Reappeared,
    RemovedRemotely,
}

impl PlanReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanReason::NotSeenBefore => "not-seen-before",
            PlanReason::Pending => "pending",
            PlanReason::RetryFailed => "retry-failed",
            PlanReason::StaleDownload => "stale-download",
            PlanReason::ContentChanged => "content-changed",
            PlanReason::LocalCopyDamaged => "local-copy-damaged",
            PlanReason::HashMatch => "hash-match",
            PlanReason::HeuristicMatch => "heuristic-match",
            PlanReason::InFlight => "in-flight",
            PlanReason::AttemptCapReached => "attempt-cap-reached",
            PlanReason::Reappeared => "reappeared",
            PlanReason::RemovedRemotely => "removed-remotely",
        }
    }
}

impl fmt::Display for PlanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlanEntry {
    pub remote_id: String,
    pub action: PlanAction,
    pub reason: PlanReason,
    /// Listing data; `None` only for `MarkMissing`.
    pub descriptor: Option<RemoteFileDescriptor>,
    /// New remote path for a record that moved without changing content.
    pub rename_to: Option<String>,
    /// The unchanged-content decision relied on size and mtime only.
    pub heuristic: bool,
    /// Store revision the decision was made against; 0 when no record
    /// existed. A download claim only succeeds at this revision.
    pub expected_revision: i64,
}

impl SyncPlanEntry {
    fn new(descriptor: &RemoteFileDescriptor, action: PlanAction, reason: PlanReason) -> Self {
        Self {
            remote_id: descriptor.remote_id.clone(),
            action,
            reason,
            descriptor: Some(descriptor.clone()),
            rename_to: None,
            heuristic: false,
            expected_revision: 0,
        }
    }
}

pub struct PlanContext<'a> {
    pub records: &'a HashMap<String, SyncRecord>,
    /// Remote ids whose local copy failed the pre-pass audit.
    pub damaged: &'a HashSet<String>,
    pub now: i64,
    pub stale_after_secs: i64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanCounts {
    pub fetch_new: u64,
    pub refetch_changed: u64,
    pub skip: u64,
    pub mark_missing: u64,
}

impl PlanCounts {
    pub fn of(entries: &[SyncPlanEntry]) -> Self {
        let mut counts = Self::default();
        for entry in entries {
            match entry.action {
                PlanAction::FetchNew => counts.fetch_new += 1,
                PlanAction::RefetchChanged => counts.refetch_changed += 1,
                PlanAction::Skip => counts.skip += 1,
                PlanAction::MarkMissing => counts.mark_missing += 1,
            }
        }
        counts
    }
}

/// Compares a listing snapshot with the stored records. Pure; the result is
/// ordered by ascending remote id.
pub fn plan(snapshot: &[RemoteFileDescriptor], ctx: &PlanContext<'_>) -> Vec<SyncPlanEntry> {
    let mut entries: BTreeMap<String, SyncPlanEntry> = BTreeMap::new();

    for descriptor in snapshot {
        if entries.contains_key(&descriptor.remote_id) {
            warn!(
                remote_id = %descriptor.remote_id,
                path = %descriptor.path,
                "duplicate remote id in listing, keeping first occurrence"
            );
            continue;
        }
        let entry = match ctx.records.get(&descriptor.remote_id) {
            None => SyncPlanEntry::new(descriptor, PlanAction::FetchNew, PlanReason::NotSeenBefore),
            Some(record) => {
                let mut entry = plan_known(descriptor, record, ctx);
                entry.expected_revision = record.revision;
                entry
            }
        };
        entries.insert(descriptor.remote_id.clone(), entry);
    }

    for record in ctx.records.values() {
        if record.status == SyncStatus::Verified && !entries.contains_key(&record.remote_id) {
            entries.insert(
                record.remote_id.clone(),
                SyncPlanEntry {
                    remote_id: record.remote_id.clone(),
                    action: PlanAction::MarkMissing,
                    reason: PlanReason::RemovedRemotely,
                    descriptor: None,
                    rename_to: None,
                    heuristic: false,
                    expected_revision: record.revision,
                },
            );
        }
    }

    entries.into_values().collect()
}

fn plan_known(
    descriptor: &RemoteFileDescriptor,
    record: &SyncRecord,
    ctx: &PlanContext<'_>,
) -> SyncPlanEntry {
    use PlanAction::*;

    match record.status {
        SyncStatus::Verified | SyncStatus::Missing => {
            if record.status == SyncStatus::Verified && ctx.damaged.contains(&record.remote_id) {
                return SyncPlanEntry::new(descriptor, RefetchChanged, PlanReason::LocalCopyDamaged);
            }
            match compare(descriptor, record) {
                Comparison::Changed => {
                    SyncPlanEntry::new(descriptor, RefetchChanged, PlanReason::ContentChanged)
                }
                matched => {
                    let reason = if record.status == SyncStatus::Missing {
                        PlanReason::Reappeared
                    } else if matched == Comparison::SameHash {
                        PlanReason::HashMatch
                    } else {
                        PlanReason::HeuristicMatch
                    };
                    let mut entry = SyncPlanEntry::new(descriptor, Skip, reason);
                    entry.heuristic = matched == Comparison::SameSizeAndTime;
                    if record.path != descriptor.path {
                        entry.rename_to = Some(descriptor.path.clone());
                    }
                    entry
                }
            }
        }
        SyncStatus::Downloading => {
            let stale = record
                .last_attempt_at
                .is_none_or(|at| ctx.now.saturating_sub(at) >= ctx.stale_after_secs);
            if stale {
                SyncPlanEntry::new(descriptor, FetchNew, PlanReason::StaleDownload)
            } else {
                SyncPlanEntry::new(descriptor, Skip, PlanReason::InFlight)
            }
        }
        SyncStatus::Failed => {
            if record.attempt_count < ctx.max_attempts {
                SyncPlanEntry::new(descriptor, FetchNew, PlanReason::RetryFailed)
            } else if compare(descriptor, record) == Comparison::Changed {
                SyncPlanEntry::new(descriptor, RefetchChanged, PlanReason::ContentChanged)
            } else {
                SyncPlanEntry::new(descriptor, Skip, PlanReason::AttemptCapReached)
            }
        }
        SyncStatus::Pending => SyncPlanEntry::new(descriptor, FetchNew, PlanReason::Pending),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    SameHash,
    SameSizeAndTime,
    Changed,
}

fn compare(descriptor: &RemoteFileDescriptor, record: &SyncRecord) -> Comparison {
    if let (Some(remote), Some(known)) = (&descriptor.content_hash, &record.content_hash) {
        return if hashes_equal(remote, known) {
            Comparison::SameHash
        } else {
            Comparison::Changed
        };
    }
    if descriptor.content_hash.is_some() {
        // Nothing stored to compare the new hash against.
        return Comparison::Changed;
    }
    let same_size = i64::try_from(descriptor.size).is_ok_and(|size| size == record.size);
    if same_size && descriptor.modified == record.remote_modified {
        Comparison::SameSizeAndTime
    } else {
        Comparison::Changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn descriptor(id: &str, path: &str, size: u64, hash: Option<&str>) -> RemoteFileDescriptor {
        RemoteFileDescriptor {
            remote_id: id.into(),
            path: path.into(),
            size,
            content_hash: hash.map(str::to_string),
            modified: Some(NOW - 100),
            created: None,
        }
    }

    fn record(id: &str, path: &str, status: SyncStatus, hash: Option<&str>) -> SyncRecord {
        let mut record = SyncRecord::new(id, path, 100);
        record.status = status;
        record.content_hash = hash.map(str::to_string);
        record.remote_modified = Some(NOW - 100);
        record.revision = 1;
        record
    }

    fn run(snapshot: &[RemoteFileDescriptor], records: Vec<SyncRecord>) -> Vec<SyncPlanEntry> {
        run_with(snapshot, records, HashSet::new())
    }

    fn run_with(
        snapshot: &[RemoteFileDescriptor],
        records: Vec<SyncRecord>,
        damaged: HashSet<String>,
    ) -> Vec<SyncPlanEntry> {
        let records: HashMap<_, _> = records
            .into_iter()
            .map(|r| (r.remote_id.clone(), r))
            .collect();
        let ctx = PlanContext {
            records: &records,
            damaged: &damaged,
            now: NOW,
            stale_after_secs: 3600,
            max_attempts: 3,
        };
        plan(snapshot, &ctx)
    }

    fn summary(entries: &[SyncPlanEntry]) -> Vec<(&str, PlanAction, PlanReason)> {
        entries
            .iter()
            .map(|e| (e.remote_id.as_str(), e.action, e.reason))
            .collect()
    }

    #[test]
    fn unseen_file_is_fetched() {
        let plan = run(&[descriptor("A", "x/1.mcd", 100, Some("h1"))], vec![]);
        assert_eq!(
            summary(&plan),
            vec![("A", PlanAction::FetchNew, PlanReason::NotSeenBefore)]
        );
    }

    #[test]
    fn verified_with_same_hash_is_skipped() {
        let plan = run(
            &[descriptor("A", "x/1.mcd", 100, Some("H1"))],
            vec![record("A", "x/1.mcd", SyncStatus::Verified, Some("h1"))],
        );
        assert_eq!(
            summary(&plan),
            vec![("A", PlanAction::Skip, PlanReason::HashMatch)]
        );
        assert!(plan[0].rename_to.is_none());
    }

    #[test]
    fn changed_hash_is_refetched() {
        let plan = run(
            &[descriptor("A", "x/1.mcd", 100, Some("h2"))],
            vec![record("A", "x/1.mcd", SyncStatus::Verified, Some("h1"))],
        );
        assert_eq!(
            summary(&plan),
            vec![("A", PlanAction::RefetchChanged, PlanReason::ContentChanged)]
        );
    }

    #[test]
    fn heuristic_match_without_remote_hash() {
        let unchanged = run(
            &[descriptor("A", "x/1.mcd", 100, None)],
            vec![record("A", "x/1.mcd", SyncStatus::Verified, Some("local"))],
        );
        assert_eq!(unchanged[0].action, PlanAction::Skip);
        assert_eq!(unchanged[0].reason, PlanReason::HeuristicMatch);
        assert!(unchanged[0].heuristic);

        let resized = run(
            &[descriptor("A", "x/1.mcd", 101, None)],
            vec![record("A", "x/1.mcd", SyncStatus::Verified, Some("local"))],
        );
        assert_eq!(resized[0].action, PlanAction::RefetchChanged);
    }

    #[test]
    fn rename_is_metadata_only() {
        let plan = run(
            &[descriptor("A", "y/renamed.mcd", 100, Some("h1"))],
            vec![record("A", "x/1.mcd", SyncStatus::Verified, Some("h1"))],
        );
        assert_eq!(plan[0].action, PlanAction::Skip);
        assert_eq!(plan[0].rename_to.as_deref(), Some("y/renamed.mcd"));
    }

    #[test]
    fn verified_record_absent_from_listing_is_marked_missing() {
        let plan = run(
            &[],
            vec![
                record("A", "a.mcd", SyncStatus::Verified, Some("h")),
                record("B", "b.mcd", SyncStatus::Failed, Some("h")),
                record("C", "c.mcd", SyncStatus::Missing, Some("h")),
            ],
        );
        assert_eq!(
            summary(&plan),
            vec![("A", PlanAction::MarkMissing, PlanReason::RemovedRemotely)]
        );
        assert!(plan[0].descriptor.is_none());
    }

    #[test]
    fn missing_record_reappearing_is_restored_or_refetched() {
        let same = run(
            &[descriptor("A", "a.mcd", 100, Some("h"))],
            vec![record("A", "a.mcd", SyncStatus::Missing, Some("h"))],
        );
        assert_eq!(
            summary(&same),
            vec![("A", PlanAction::Skip, PlanReason::Reappeared)]
        );

        let changed = run(
            &[descriptor("A", "a.mcd", 100, Some("h2"))],
            vec![record("A", "a.mcd", SyncStatus::Missing, Some("h"))],
        );
        assert_eq!(changed[0].action, PlanAction::RefetchChanged);
    }

    #[test]
    fn downloading_is_in_flight_until_stale() {
        let mut fresh = record("A", "a.mcd", SyncStatus::Downloading, Some("h"));
        fresh.last_attempt_at = Some(NOW - 60);
        let mut stale = record("B", "b.mcd", SyncStatus::Downloading, Some("h"));
        stale.last_attempt_at = Some(NOW - 7200);

        let plan = run(
            &[
                descriptor("A", "a.mcd", 100, Some("h")),
                descriptor("B", "b.mcd", 100, Some("h")),
            ],
            vec![fresh, stale],
        );
        assert_eq!(
            summary(&plan),
            vec![
                ("A", PlanAction::Skip, PlanReason::InFlight),
                ("B", PlanAction::FetchNew, PlanReason::StaleDownload),
            ]
        );
    }

    #[test]
    fn failed_records_retry_until_cap() {
        let mut retry = record("A", "a.mcd", SyncStatus::Failed, Some("h"));
        retry.attempt_count = 2;
        let mut capped = record("B", "b.mcd", SyncStatus::Failed, Some("h"));
        capped.attempt_count = 3;
        let mut capped_changed = record("C", "c.mcd", SyncStatus::Failed, Some("h"));
        capped_changed.attempt_count = 3;

        let plan = run(
            &[
                descriptor("A", "a.mcd", 100, Some("h")),
                descriptor("B", "b.mcd", 100, Some("h")),
                descriptor("C", "c.mcd", 100, Some("new")),
            ],
            vec![retry, capped, capped_changed],
        );
        assert_eq!(
            summary(&plan),
            vec![
                ("A", PlanAction::FetchNew, PlanReason::RetryFailed),
                ("B", PlanAction::Skip, PlanReason::AttemptCapReached),
                ("C", PlanAction::RefetchChanged, PlanReason::ContentChanged),
            ]
        );
    }

    #[test]
    fn damaged_local_copy_is_refetched() {
        let damaged = HashSet::from(["A".to_string()]);
        let plan = run_with(
            &[descriptor("A", "a.mcd", 100, Some("h"))],
            vec![record("A", "a.mcd", SyncStatus::Verified, Some("h"))],
            damaged,
        );
        assert_eq!(
            summary(&plan),
            vec![("A", PlanAction::RefetchChanged, PlanReason::LocalCopyDamaged)]
        );
    }

    #[test]
    fn output_is_sorted_and_duplicates_dropped() {
        let plan = run(
            &[
                descriptor("C", "c.mcd", 1, None),
                descriptor("A", "a.mcd", 1, None),
                descriptor("C", "c-copy.mcd", 1, None),
                descriptor("B", "b.mcd", 1, None),
            ],
            vec![],
        );
        let ids: Vec<_> = plan.iter().map(|e| e.remote_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        let c = plan.iter().find(|e| e.remote_id == "C").unwrap();
        assert_eq!(c.descriptor.as_ref().unwrap().path, "c.mcd");
    }

    #[test]
    fn entries_carry_the_revision_they_were_planned_against() {
        let mut known = record("B", "b.mcd", SyncStatus::Failed, Some("h"));
        known.revision = 4;
        let plan = run(
            &[
                descriptor("A", "a.mcd", 100, Some("h")),
                descriptor("B", "b.mcd", 100, Some("h")),
            ],
            vec![known],
        );
        let revisions: Vec<_> = plan
            .iter()
            .map(|e| (e.remote_id.as_str(), e.expected_revision))
            .collect();
        assert_eq!(revisions, vec![("A", 0), ("B", 4)]);
    }

    #[test]
    fn counts_by_action() {
        let plan = run(
            &[
                descriptor("A", "a.mcd", 100, Some("h")),
                descriptor("B", "b.mcd", 100, Some("h")),
            ],
            vec![
                record("B", "b.mcd", SyncStatus::Verified, Some("h")),
                record("Z", "z.mcd", SyncStatus::Verified, Some("h")),
            ],
        );
        assert_eq!(
            PlanCounts::of(&plan),
            PlanCounts {
                fetch_new: 1,
                refetch_changed: 0,
                skip: 1,
                mark_missing: 1,
            }
        );
    }
}
