//! The worktree seam.
//!
//! The sync engine never touches storage directly; it goes through the
//! [`Worktree`] trait, which models the dedicated sync branch as an
//! append-only, content-addressed log with atomic compare-and-swap ref
//! advancement. The git implementation lives in [`crate::git`]; the
//! in-memory implementation here backs tests, including multi-replica
//! convergence scenarios through a shared [`MemoryRemote`] hub.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use weft_core::{AtticEntry, AtticEntryId, IdMap, IssueId, IssueRecord};

use crate::error::{SyncError, SyncResult};

/// Opaque reference to a committed snapshot (a git oid, or a synthetic id
/// for the in-memory worktree).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommitRef(String);

impl CommitRef {
    /// Wraps a backend commit identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of attempting to advance the remote's sync-branch ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The remote ref now points at the published commit.
    Published,
    /// The remote moved concurrently; re-fetch and re-diff. This is an
    /// optimistic-concurrency failure, not a content conflict.
    Rejected,
}

/// A record that could not be parsed out of a snapshot.
///
/// Corrupt records are skipped and reported; they never abort a cycle,
/// and the engine leaves their stored bytes untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptEntry {
    /// Path of the offending file within the snapshot.
    pub path: String,
    /// The internal id recovered from the path, when the filename parsed.
    pub id: Option<IssueId>,
    /// Parse error message.
    pub message: String,
}

/// A loaded, immutable view of one sync-branch tip.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// The commit this snapshot was loaded from, if the branch exists.
    pub tip: Option<CommitRef>,
    /// All parseable records, keyed by internal id.
    pub records: BTreeMap<IssueId, IssueRecord>,
    /// The display-id mapping table.
    pub idmap: IdMap,
    /// All attic entries.
    pub attic: BTreeMap<AtticEntryId, AtticEntry>,
    /// Records that failed to parse.
    pub corrupt: Vec<CorruptEntry>,
}

impl Snapshot {
    /// The ids of records whose files failed to parse.
    #[must_use]
    pub fn corrupt_ids(&self) -> BTreeSet<IssueId> {
        self.corrupt.iter().filter_map(|c| c.id).collect()
    }
}

/// The mutations of one sync cycle, applied as a single atomic unit.
///
/// Entries are upserts over the current branch tip; the engine never
/// deletes record files, so anything absent here is carried forward
/// unchanged (including files it could not parse).
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Records to write or replace.
    pub records: BTreeMap<IssueId, IssueRecord>,
    /// Replacement mapping table, when it gained entries.
    pub idmap: Option<IdMap>,
    /// New attic entries. Existing entries under the same key win; the
    /// attic is immutable once written.
    pub attic: BTreeMap<AtticEntryId, AtticEntry>,
    /// Commit message.
    pub message: String,
}

impl ChangeSet {
    /// Returns true if the change set carries no mutations at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.idmap.is_none() && self.attic.is_empty()
    }
}

/// Private checkout of the dedicated sync branch.
///
/// Implementations must guarantee:
/// - `commit` is all-or-nothing; partial writes are never observable.
/// - `publish` advances the remote ref only if it still points where the
///   preceding `fetch` saw it (compare-and-swap).
/// - `checkout` repairs a crashed/stale materialization before use, and
///   repair never discards durable data the checkout does not own.
pub trait Worktree {
    /// Materializes (creating if absent) the private checkout at the sync
    /// branch's current tip and returns a snapshot of it.
    fn checkout(&mut self) -> SyncResult<Snapshot>;

    /// Retrieves the remote's current sync-branch tip without mutating
    /// local branch state. Returns `None` when no remote is configured or
    /// the remote has no sync branch yet.
    fn fetch(&mut self) -> SyncResult<Option<Snapshot>>;

    /// The remote snapshot as of the last `fetch`, without network I/O.
    fn last_known_remote(&self) -> SyncResult<Option<Snapshot>>;

    /// The snapshot at the last successfully-synced point, or `None`
    /// before the first sync.
    fn base(&self) -> SyncResult<Option<Snapshot>>;

    /// Writes the change set as one atomic commit on the sync branch and
    /// returns the new tip. A no-op change set against an undiverged
    /// branch returns the existing tip without committing.
    fn commit(&mut self, changes: &ChangeSet) -> SyncResult<CommitRef>;

    /// Attempts to advance the remote's sync-branch ref to `commit`.
    /// Succeeds trivially when no remote is configured.
    fn publish(&mut self, commit: &CommitRef) -> SyncResult<PublishOutcome>;

    /// Records `commit` as the new last-synced point and clears the dirty
    /// set.
    fn mark_synced(&mut self, commit: &CommitRef) -> SyncResult<()>;

    /// Notification hook: a collaborator mutated the record with this id.
    fn note_mutation(&mut self, id: IssueId);

    /// Internal ids touched since the last successful sync.
    fn dirty_ids(&self) -> BTreeSet<IssueId>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Full store content at one commit.
#[derive(Debug, Clone, Default, PartialEq)]
struct StoreState {
    records: BTreeMap<IssueId, IssueRecord>,
    idmap: IdMap,
    attic: BTreeMap<AtticEntryId, AtticEntry>,
}

#[derive(Debug, Clone)]
struct MemCommit {
    parents: Vec<CommitRef>,
    state: StoreState,
}

#[derive(Debug, Default)]
struct RemoteInner {
    commits: BTreeMap<String, MemCommit>,
    tip: Option<CommitRef>,
    unreachable: bool,
}

/// A shared in-memory "remote" several [`MemoryWorktree`] replicas can
/// sync through.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    inner: Mutex<RemoteInner>,
}

impl MemoryRemote {
    /// Creates an empty shared remote.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulates a network partition: while unreachable, fetch and publish
    /// fail with a retryable error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unreachable = unreachable;
    }

    /// The current remote tip, if any.
    #[must_use]
    pub fn tip(&self) -> Option<CommitRef> {
        self.inner.lock().tip.clone()
    }
}

/// In-memory [`Worktree`] for tests.
#[derive(Debug)]
pub struct MemoryWorktree {
    name: String,
    remote: Option<Arc<MemoryRemote>>,
    commits: BTreeMap<String, MemCommit>,
    local_tip: Option<CommitRef>,
    tracking_tip: Option<CommitRef>,
    base_ref: Option<CommitRef>,
    dirty: BTreeSet<IssueId>,
    poisoned: BTreeSet<IssueId>,
    fail_commits: u32,
    seq: u64,
}

impl MemoryWorktree {
    /// Creates a detached worktree with no remote.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remote: None,
            commits: BTreeMap::new(),
            local_tip: None,
            tracking_tip: None,
            base_ref: None,
            dirty: BTreeSet::new(),
            poisoned: BTreeSet::new(),
            fail_commits: 0,
            seq: 0,
        }
    }

    /// Creates a worktree attached to a shared remote.
    #[must_use]
    pub fn with_remote(name: impl Into<String>, remote: Arc<MemoryRemote>) -> Self {
        let mut wt = Self::new(name);
        wt.remote = Some(remote);
        wt
    }

    /// Simulates the record CRUD layer: upserts a record (allocating a
    /// display id if needed) as one local commit, and fires the mutation
    /// hook.
    pub fn put_record(&mut self, record: IssueRecord) -> SyncResult<CommitRef> {
        let mut state = self.state_at(self.local_tip.as_ref());
        state.idmap.allocate(record.id).map_err(SyncError::from)?;
        let id = record.id;
        state.records.insert(id, record);
        let commit = self.append_commit(vec![self.local_tip.clone()], state);
        self.note_mutation(id);
        Ok(commit)
    }

    /// The current record for `id`, if any.
    #[must_use]
    pub fn record(&self, id: &IssueId) -> Option<IssueRecord> {
        self.state_at(self.local_tip.as_ref()).records.get(id).cloned()
    }

    /// Makes the next `n` commits fail, leaving state untouched. Used to
    /// simulate a crash during the commit step.
    pub fn fail_next_commits(&mut self, n: u32) {
        self.fail_commits = n;
    }

    /// Marks a record id as unparseable in this worktree's local
    /// checkout, simulating a corrupt local copy.
    pub fn poison(&mut self, id: IssueId) {
        self.poisoned.insert(id);
    }

    /// The local branch tip.
    #[must_use]
    pub fn local_tip(&self) -> Option<CommitRef> {
        self.local_tip.clone()
    }

    fn next_ref(&mut self) -> CommitRef {
        self.seq += 1;
        CommitRef::new(format!("{}-{}", self.name, self.seq))
    }

    fn append_commit(&mut self, parents: Vec<Option<CommitRef>>, state: StoreState) -> CommitRef {
        let id = self.next_ref();
        let parents: Vec<CommitRef> = parents.into_iter().flatten().collect();
        self.commits
            .insert(id.as_str().to_string(), MemCommit { parents, state });
        self.local_tip = Some(id.clone());
        id
    }

    fn state_at(&self, tip: Option<&CommitRef>) -> StoreState {
        tip.and_then(|t| self.commits.get(t.as_str()))
            .map(|c| c.state.clone())
            .unwrap_or_default()
    }

    fn snapshot_at(&self, tip: Option<&CommitRef>, apply_poison: bool) -> Snapshot {
        let mut state = self.state_at(tip);
        let mut corrupt = Vec::new();
        if apply_poison {
            for id in &self.poisoned {
                if state.records.remove(id).is_some() {
                    corrupt.push(CorruptEntry {
                        path: format!("records/{id}.json"),
                        id: Some(*id),
                        message: "poisoned for test".into(),
                    });
                }
            }
        }
        Snapshot {
            tip: tip.cloned(),
            records: state.records,
            idmap: state.idmap,
            attic: state.attic,
            corrupt,
        }
    }

    /// Walks the commit graph from `descendant` looking for `ancestor`.
    fn is_ancestor(&self, ancestor: &CommitRef, descendant: &CommitRef) -> bool {
        let mut queue = vec![descendant.clone()];
        let mut seen = BTreeSet::new();
        while let Some(current) = queue.pop() {
            if current == *ancestor {
                return true;
            }
            if !seen.insert(current.as_str().to_string()) {
                continue;
            }
            if let Some(commit) = self.commits.get(current.as_str()) {
                queue.extend(commit.parents.iter().cloned());
            }
        }
        false
    }

    fn check_reachable(&self, remote: &MemoryRemote) -> SyncResult<()> {
        if remote.inner.lock().unreachable {
            return Err(SyncError::unreachable_retryable("remote unreachable"));
        }
        Ok(())
    }
}

impl Worktree for MemoryWorktree {
    fn checkout(&mut self) -> SyncResult<Snapshot> {
        Ok(self.snapshot_at(self.local_tip.clone().as_ref(), true))
    }

    fn fetch(&mut self) -> SyncResult<Option<Snapshot>> {
        let Some(remote) = self.remote.clone() else {
            return Ok(None);
        };
        self.check_reachable(&remote)?;

        let inner = remote.inner.lock();
        // Mirror the remote's objects into the local store, as a git
        // fetch would.
        for (id, commit) in &inner.commits {
            self.commits.entry(id.clone()).or_insert_with(|| commit.clone());
        }
        self.tracking_tip = inner.tip.clone();
        drop(inner);

        Ok(self
            .tracking_tip
            .clone()
            .map(|tip| self.snapshot_at(Some(&tip), false)))
    }

    fn last_known_remote(&self) -> SyncResult<Option<Snapshot>> {
        Ok(self
            .tracking_tip
            .clone()
            .map(|tip| self.snapshot_at(Some(&tip), false)))
    }

    fn base(&self) -> SyncResult<Option<Snapshot>> {
        Ok(self
            .base_ref
            .clone()
            .map(|tip| self.snapshot_at(Some(&tip), false)))
    }

    fn commit(&mut self, changes: &ChangeSet) -> SyncResult<CommitRef> {
        if self.fail_commits > 0 {
            self.fail_commits -= 1;
            return Err(SyncError::WorktreeInconsistent(
                "simulated commit failure".into(),
            ));
        }

        let local_tip = self.local_tip.clone();
        let diverged = match (&self.tracking_tip, &local_tip) {
            (Some(tracking), Some(local)) => !self.is_ancestor(tracking, local),
            (Some(_), None) => true,
            (None, _) => false,
        };

        if changes.is_empty() && !diverged {
            if let Some(tip) = &local_tip {
                return Ok(tip.clone());
            }
        }

        let mut state = self.state_at(local_tip.as_ref());
        for (id, record) in &changes.records {
            state.records.insert(*id, record.clone());
        }
        if let Some(idmap) = &changes.idmap {
            state.idmap = idmap.clone();
        }
        for (key, entry) in &changes.attic {
            state.attic.entry(*key).or_insert_with(|| entry.clone());
        }

        // Fast-forward to the remote tip when the merge lands on exactly
        // its content and its history contains ours.
        if let Some(tracking) = self.tracking_tip.clone() {
            let can_fast_forward = match &local_tip {
                None => true,
                Some(local) => self.is_ancestor(local, &tracking),
            };
            if can_fast_forward && state == self.state_at(Some(&tracking)) {
                self.local_tip = Some(tracking.clone());
                return Ok(tracking);
            }
        }

        let second_parent = if diverged { self.tracking_tip.clone() } else { None };
        Ok(self.append_commit(vec![local_tip, second_parent], state))
    }

    fn publish(&mut self, commit: &CommitRef) -> SyncResult<PublishOutcome> {
        let Some(remote) = self.remote.clone() else {
            return Ok(PublishOutcome::Published);
        };
        self.check_reachable(&remote)?;

        let mut inner = remote.inner.lock();
        let fast_forward = match &inner.tip {
            None => true,
            Some(tip) => self.is_ancestor(tip, commit),
        };
        if !fast_forward {
            return Ok(PublishOutcome::Rejected);
        }

        // Upload the ancestry closure, then advance the ref.
        let mut queue = vec![commit.clone()];
        while let Some(current) = queue.pop() {
            if inner.commits.contains_key(current.as_str()) {
                continue;
            }
            if let Some(found) = self.commits.get(current.as_str()) {
                inner
                    .commits
                    .insert(current.as_str().to_string(), found.clone());
                queue.extend(found.parents.iter().cloned());
            }
        }
        inner.tip = Some(commit.clone());
        self.tracking_tip = Some(commit.clone());
        Ok(PublishOutcome::Published)
    }

    fn mark_synced(&mut self, commit: &CommitRef) -> SyncResult<()> {
        self.base_ref = Some(commit.clone());
        self.dirty.clear();
        Ok(())
    }

    fn note_mutation(&mut self, id: IssueId) {
        self.dirty.insert(id);
    }

    fn dirty_ids(&self) -> BTreeSet<IssueId> {
        self.dirty.clone()
    }
}
