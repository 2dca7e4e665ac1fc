//! Sync orchestrator state machine.
//!
//! Drives the pull → diff → resolve → commit → publish cycle. A rejected
//! publish means the remote advanced while we were resolving; the cycle
//! loops back to fetching and re-diffs against the new tip. Resolution is
//! deterministic, so the retry converges in at most as many iterations as
//! there are racing writers, and the cap below is a backstop, not a tuning
//! knob.

use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use weft_core::{AtticEntry, AtticEntryId, CoreError, DisplayId, IdMap, IssueId, IssueRecord,
    ResolutionReason};

use crate::attic;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::resolver::{self, DiffClass, Side};
use crate::worktree::{ChangeSet, CommitRef, CorruptEntry, PublishOutcome, Snapshot, Worktree};

/// The phase the sync state machine is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No cycle running.
    Idle,
    /// Obtaining the remote snapshot.
    Fetching,
    /// Classifying records against the last-synced base.
    Diffing,
    /// Resolving divergent records.
    Resolving,
    /// Writing the merged change set.
    Committing,
    /// Advancing the remote ref.
    Publishing,
    /// The last cycle ended in an unrecoverable error.
    Failed,
}

impl SyncPhase {
    /// Returns true while a cycle is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncPhase::Fetching
                | SyncPhase::Diffing
                | SyncPhase::Resolving
                | SyncPhase::Committing
                | SyncPhase::Publishing
        )
    }

    /// Returns true if a new cycle can start.
    #[must_use]
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncPhase::Idle | SyncPhase::Failed)
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Diffing => "diffing",
            Self::Resolving => "resolving",
            Self::Committing => "committing",
            Self::Publishing => "publishing",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// What a sync cycle is allowed to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Pull, resolve, and publish.
    #[default]
    Full,
    /// Integrate and publish, but fail on contention instead of looping.
    PushOnly,
    /// Pull and resolve without publishing.
    PullOnly,
}

/// One automatically-resolved conflict, with everything needed to audit
/// or reverse it.
#[derive(Debug, Clone)]
pub struct ConflictReport {
    /// Internal id of the record.
    pub issue_id: IssueId,
    /// Display id, when the mapping table has one.
    pub display_id: Option<DisplayId>,
    /// Which side won.
    pub winner: Side,
    /// Version of the merged record.
    pub merged_version: u64,
    /// Version that lost and went to the attic.
    pub losing_version: u64,
    /// Which resolution step decided it.
    pub reason: ResolutionReason,
    /// Key of the attic entry holding the losing payload.
    pub attic_entry: AtticEntryId,
}

/// Result of a completed sync cycle.
#[derive(Debug, Clone)]
pub struct SyncSummary {
    /// The mode the cycle ran in.
    pub mode: SyncMode,
    /// Records applied from the remote.
    pub pulled: u64,
    /// Local records shared with the remote.
    pub pushed: u64,
    /// Conflicts resolved, with attic references.
    pub conflicts: Vec<ConflictReport>,
    /// Records skipped because their stored form failed to parse.
    pub skipped: Vec<CorruptEntry>,
    /// The sync-branch tip after the cycle.
    pub commit: Option<CommitRef>,
    /// Whether the remote ref was advanced.
    pub published: bool,
    /// Full cycles run (more than one means publishes were rejected).
    pub attempts: u32,
}

impl SyncSummary {
    /// Returns true if the cycle found nothing to do.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.pulled == 0 && self.pushed == 0 && self.conflicts.is_empty()
    }
}

/// Cumulative statistics across cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Completed cycles.
    pub cycles_completed: u64,
    /// Total records pulled.
    pub records_pulled: u64,
    /// Total records pushed.
    pub records_pushed: u64,
    /// Total conflicts resolved.
    pub conflicts_resolved: u64,
    /// Publish rejections that triggered a re-fetch.
    pub publish_retries: u64,
    /// Last error message, if the previous cycle failed.
    pub last_error: Option<String>,
}

/// Observability view: how far ahead/behind this replica is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    /// Records changed locally since the last sync point.
    pub ahead: u64,
    /// Records changed remotely since the last sync point.
    pub behind: u64,
    /// Always zero: resolution is synchronous and automatic, so no
    /// conflict ever waits on user action.
    pub pending_conflicts: u64,
}

/// The sync orchestrator.
///
/// Owns the state machine and drives a [`Worktree`] through the cycle.
/// Cross-process exclusion comes from the worktree's checkout lock;
/// in-process exclusion from the mutex around it.
pub struct SyncEngine<W: Worktree> {
    config: SyncConfig,
    worktree: Mutex<W>,
    phase: RwLock<SyncPhase>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
}

impl<W: Worktree> SyncEngine<W> {
    /// Creates an engine around a checked-out worktree.
    pub fn new(config: SyncConfig, worktree: W) -> Self {
        Self {
            config,
            worktree: Mutex::new(worktree),
            phase: RwLock::new(SyncPhase::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// The current phase.
    pub fn phase(&self) -> SyncPhase {
        *self.phase.read()
    }

    /// Cumulative statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Direct access to the underlying worktree.
    pub fn worktree(&self) -> MutexGuard<'_, W> {
        self.worktree.lock()
    }

    /// Requests cancellation of the running cycle. Safe from any thread;
    /// the cycle stops at the next phase boundary. Durable state is only
    /// ever touched by the atomic commit, so a cancelled cycle leaves
    /// nothing half-written.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_phase(&self, phase: SyncPhase) {
        tracing::debug!(%phase, "sync phase");
        *self.phase.write() = phase;
    }

    /// Runs one sync operation to completion.
    pub fn sync(&self, mode: SyncMode) -> SyncResult<SyncSummary> {
        if !self.phase().can_start_sync() {
            return Err(SyncError::Busy {
                phase: self.phase().to_string(),
            });
        }
        self.reset_cancel();

        let result = self.run_cycle(mode);
        match &result {
            Ok(summary) => {
                self.set_phase(SyncPhase::Idle);
                let mut stats = self.stats.write();
                stats.cycles_completed += 1;
                stats.records_pulled += summary.pulled;
                stats.records_pushed += summary.pushed;
                stats.conflicts_resolved += summary.conflicts.len() as u64;
                stats.publish_retries += u64::from(summary.attempts.saturating_sub(1));
                stats.last_error = None;
            }
            Err(err) => {
                self.set_phase(SyncPhase::Failed);
                self.stats.write().last_error = Some(err.to_string());
            }
        }
        result
    }

    /// Runs `sync`, retrying retryable failures per the configured
    /// backoff schedule.
    pub fn sync_with_retry(&self, mode: SyncMode) -> SyncResult<SyncSummary> {
        let retry = self.config.retry.clone();
        let mut last_error = None;

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                std::thread::sleep(retry.delay_for_attempt(attempt));
            }
            self.check_cancelled()?;

            match self.sync(mode) {
                Ok(summary) => return Ok(summary),
                Err(err) if err.is_retryable() && attempt + 1 < retry.max_attempts => {
                    tracing::warn!(error = %err, attempt, "sync attempt failed; retrying");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::unreachable_fatal("no sync attempts made")))
    }

    /// Reports how far this replica is ahead of / behind the last-known
    /// remote state. Offline: uses the remote-tracking state from the most
    /// recent fetch rather than the network.
    pub fn status(&self) -> SyncResult<SyncStatus> {
        let mut wt = self.worktree.lock();
        let local = wt.checkout()?;
        let base = wt.base()?;
        let remote = wt.last_known_remote()?;

        let empty = Snapshot::default();
        let base_snap = base.as_ref().unwrap_or(&empty);
        let remote_snap = remote.as_ref().unwrap_or(&empty);

        let mut ahead = 0u64;
        let mut behind = 0u64;
        for id in record_ids(&local, remote_snap, &wt.dirty_ids()) {
            match resolver::classify(
                base_snap.records.get(&id),
                local.records.get(&id),
                remote_snap.records.get(&id),
            ) {
                DiffClass::Unchanged => {}
                DiffClass::LocalOnly => ahead += 1,
                DiffClass::RemoteOnly => behind += 1,
                DiffClass::Divergent => {
                    ahead += 1;
                    behind += 1;
                }
            }
        }

        Ok(SyncStatus {
            ahead,
            behind,
            pending_conflicts: 0,
        })
    }

    /// Lists attic entries, optionally filtered to one record.
    pub fn list_attic(&self, issue: Option<IssueId>) -> SyncResult<Vec<AtticEntry>> {
        let mut wt = self.worktree.lock();
        let snapshot = wt.checkout()?;
        Ok(attic::list(&snapshot.attic, issue)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Restores an archived payload as a new current version of its
    /// record. The attic entry is left untouched.
    pub fn restore_attic(&self, entry_id: AtticEntryId) -> SyncResult<IssueRecord> {
        let mut wt = self.worktree.lock();
        let snapshot = wt.checkout()?;

        let entry = snapshot.attic.get(&entry_id).ok_or_else(|| {
            SyncError::Core(CoreError::UnknownIdentifier(entry_id.to_string()))
        })?;
        let restored = attic::restore(&snapshot.records, entry)?;

        let mut changes = ChangeSet {
            message: format!("weft(attic): restore {entry_id}"),
            ..ChangeSet::default()
        };
        changes.records.insert(restored.id, restored.clone());
        wt.commit(&changes)?;
        wt.note_mutation(restored.id);

        tracing::info!(issue = %restored.id, version = restored.version, "restored attic entry");
        Ok(restored)
    }

    fn run_cycle(&self, mode: SyncMode) -> SyncResult<SyncSummary> {
        let mut wt = self.worktree.lock();
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            self.set_phase(SyncPhase::Fetching);
            let local = wt.checkout()?;
            let remote = self.fetch_with_backoff(&mut *wt)?;
            self.check_cancelled()?;

            self.set_phase(SyncPhase::Diffing);
            let base = wt.base()?;
            let dirty = wt.dirty_ids();
            self.check_cancelled()?;

            self.set_phase(SyncPhase::Resolving);
            let plan = build_plan(base.as_ref(), &local, remote.as_ref(), &dirty);
            self.check_cancelled()?;

            self.set_phase(SyncPhase::Committing);
            let commit = wt.commit(&plan.changes)?;

            self.set_phase(SyncPhase::Publishing);
            let published = if mode == SyncMode::PullOnly {
                false
            } else {
                match wt.publish(&commit)? {
                    PublishOutcome::Published => true,
                    PublishOutcome::Rejected => {
                        if mode == SyncMode::PushOnly
                            || attempts >= self.config.max_publish_attempts
                        {
                            return Err(SyncError::Contention { attempts });
                        }
                        tracing::debug!(attempts, "publish rejected; remote advanced, refetching");
                        continue;
                    }
                }
            };

            // The new sync point is whatever state the remote is known to
            // share: the published commit, or on pull-only the remote tip
            // we just integrated.
            let sync_point = if published {
                Some(commit.clone())
            } else {
                remote.as_ref().and_then(|r| r.tip.clone()).or_else(|| Some(commit.clone()))
            };
            if let Some(point) = &sync_point {
                wt.mark_synced(point)?;
            }

            let pushed = if published { plan.local_only } else { 0 };
            let summary = SyncSummary {
                mode,
                pulled: plan.pulled,
                pushed,
                conflicts: plan.conflicts,
                skipped: plan.skipped,
                commit: Some(commit),
                published,
                attempts,
            };
            tracing::info!(
                pulled = summary.pulled,
                pushed = summary.pushed,
                conflicts = summary.conflicts.len(),
                attempts,
                "sync cycle complete"
            );
            return Ok(summary);
        }
    }

    fn fetch_with_backoff(&self, wt: &mut W) -> SyncResult<Option<Snapshot>> {
        let retry = &self.config.retry;
        let mut last_error = None;

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                std::thread::sleep(retry.delay_for_attempt(attempt));
            }
            self.check_cancelled()?;

            match wt.fetch() {
                Ok(snapshot) => return Ok(snapshot),
                Err(err) if err.is_retryable() && attempt + 1 < retry.max_attempts => {
                    tracing::warn!(error = %err, attempt, "fetch failed; backing off");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::unreachable_fatal("no fetch attempts made")))
    }
}

/// The merged change set plus the bookkeeping a summary needs.
struct MergePlan {
    changes: ChangeSet,
    pulled: u64,
    local_only: u64,
    conflicts: Vec<ConflictReport>,
    skipped: Vec<CorruptEntry>,
}

fn record_ids(
    local: &Snapshot,
    remote: &Snapshot,
    dirty: &BTreeSet<IssueId>,
) -> BTreeSet<IssueId> {
    local
        .records
        .keys()
        .chain(remote.records.keys())
        .copied()
        .chain(dirty.iter().copied())
        .collect()
}

/// Classifies every record and builds the atomic change set for this
/// cycle. All resolutions are independent of each other; order over ids
/// does not affect the outcome.
fn build_plan(
    base: Option<&Snapshot>,
    local: &Snapshot,
    remote: Option<&Snapshot>,
    dirty: &BTreeSet<IssueId>,
) -> MergePlan {
    let empty = Snapshot::default();
    let base_snap = base.unwrap_or(&empty);
    let remote_snap = remote.unwrap_or(&empty);

    let mut skipped: Vec<CorruptEntry> = local.corrupt.clone();
    skipped.extend(remote_snap.corrupt.iter().cloned());
    let corrupt_ids: BTreeSet<IssueId> = local
        .corrupt_ids()
        .into_iter()
        .chain(remote_snap.corrupt_ids())
        .collect();

    let mut changes = ChangeSet::default();
    let mut new_attic: BTreeMap<AtticEntryId, AtticEntry> = BTreeMap::new();
    let mut pulled = 0u64;
    let mut local_only = 0u64;
    let mut resolutions = Vec::new();

    for id in record_ids(local, remote_snap, dirty) {
        if corrupt_ids.contains(&id) {
            continue;
        }
        let base_rec = base_snap.records.get(&id);
        let local_rec = local.records.get(&id);
        let remote_rec = remote_snap.records.get(&id);

        match resolver::classify(base_rec, local_rec, remote_rec) {
            DiffClass::Unchanged => {
                // Same content; converge the version counter on the higher
                // side so both replicas agree on bookkeeping too.
                if let (Some(l), Some(r)) = (local_rec, remote_rec) {
                    if r.version > l.version {
                        changes.records.insert(id, r.clone());
                    }
                }
            }
            DiffClass::LocalOnly => local_only += 1,
            DiffClass::RemoteOnly => {
                if let Some(r) = remote_rec {
                    changes.records.insert(id, r.clone());
                    pulled += 1;
                }
            }
            DiffClass::Divergent => {
                if let (Some(l), Some(r)) = (local_rec, remote_rec) {
                    let resolution = resolver::resolve(l, r);
                    changes.records.insert(id, resolution.merged.clone());
                    resolutions.push(resolution);
                }
            }
        }
    }

    // Remote attic entries the local branch has not seen yet.
    for (key, entry) in &remote_snap.attic {
        if !local.attic.contains_key(key) {
            changes.attic.insert(*key, entry.clone());
        }
    }

    // Archive the losers of this cycle's resolutions. Already-present
    // entries (a retried cycle, or the other replica resolving the same
    // pair first) are left untouched.
    let mut conflicts = Vec::new();
    let idmap = merged_idmap(local, remote_snap, &changes.records);
    for resolution in resolutions {
        let key = resolution.archived.entry_id();
        if !local.attic.contains_key(&key) && !changes.attic.contains_key(&key) {
            attic::archive(&mut new_attic, resolution.archived.clone());
        }
        conflicts.push(ConflictReport {
            issue_id: resolution.merged.id,
            display_id: idmap.display_of(&resolution.merged.id).cloned(),
            winner: resolution.winner,
            merged_version: resolution.merged.version,
            losing_version: resolution.archived.superseded_version,
            reason: resolution.reason,
            attic_entry: key,
        });
    }
    changes.attic.append(&mut new_attic);

    if idmap != local.idmap {
        changes.idmap = Some(idmap);
    }

    changes.message = commit_message(&changes, local, &conflicts);

    MergePlan {
        changes,
        pulled,
        local_only,
        conflicts,
        skipped,
    }
}

/// Union of both mapping tables, extended to cover every live record.
fn merged_idmap(
    local: &Snapshot,
    remote: &Snapshot,
    upserts: &BTreeMap<IssueId, IssueRecord>,
) -> IdMap {
    let mut merged = IdMap::merge(&local.idmap, &remote.idmap);
    for id in local.records.keys().chain(upserts.keys()) {
        // Deterministic, and a no-op for already-mapped ids.
        let _ = merged.allocate(*id);
    }
    merged
}

const MAX_DETAILED_CHANGES: usize = 5;
const COMMIT_PREFIX: &str = "weft(sync):";

/// Renders the sync commit message: a count subject, plus a short body
/// naming each change when there are few of them.
fn commit_message(changes: &ChangeSet, local: &Snapshot, conflicts: &[ConflictReport]) -> String {
    let resolved_ids: BTreeSet<IssueId> = conflicts.iter().map(|c| c.issue_id).collect();
    let mut created = 0usize;
    let mut updated = 0usize;
    let mut details = Vec::new();

    for (id, record) in &changes.records {
        let kind = if resolved_ids.contains(id) {
            "resolved"
        } else if local.records.contains_key(id) {
            updated += 1;
            "updated"
        } else {
            created += 1;
            "created"
        };

        let title = &record.payload.title;
        let title = if title.len() > 40 {
            format!("{}...", &title[..37])
        } else {
            title.clone()
        };
        details.push(format!("{kind} {id}: \"{title}\""));
    }

    let mut parts = Vec::new();
    if created > 0 {
        parts.push(format!("+{created} created"));
    }
    if updated > 0 {
        parts.push(format!("~{updated} updated"));
    }
    if !conflicts.is_empty() {
        parts.push(format!("!{} resolved", conflicts.len()));
    }

    let subject = if parts.is_empty() {
        format!("{COMMIT_PREFIX} no changes")
    } else {
        format!("{COMMIT_PREFIX} {}", parts.join(", "))
    };

    if details.is_empty() || details.len() > MAX_DETAILED_CHANGES {
        subject
    } else {
        format!("{subject}\n\n{}", details.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_checks() {
        assert!(SyncPhase::Idle.can_start_sync());
        assert!(SyncPhase::Failed.can_start_sync());
        assert!(!SyncPhase::Fetching.can_start_sync());
        assert!(!SyncPhase::Publishing.can_start_sync());

        assert!(SyncPhase::Resolving.is_active());
        assert!(!SyncPhase::Idle.is_active());
        assert!(!SyncPhase::Failed.is_active());
    }

    #[test]
    fn phase_display() {
        assert_eq!(SyncPhase::Fetching.to_string(), "fetching");
        assert_eq!(SyncPhase::Failed.to_string(), "failed");
    }
}
