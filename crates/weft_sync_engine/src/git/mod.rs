//! Git-backed [`Worktree`] implementation.
//!
//! The dedicated sync branch lives at `refs/heads/weft/sync` (configurable)
//! and is materialized into a private checkout under `<gitdir>/weft/`,
//! never in the user's working tree. Commits are built object-level (blob
//! → tree → commit) and the branch ref advances with compare-and-swap
//! semantics; publishing is a plain fast-forward push, so a concurrently
//! advanced remote surfaces as a rejection, not a merge.

mod layout;

use fs2::FileExt;
use git2::build::TreeUpdateBuilder;
use git2::{FileMode, Oid, Repository, Signature};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use weft_core::IssueId;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::worktree::{ChangeSet, CommitRef, PublishOutcome, Snapshot, Worktree};

const LOCK_FILE: &str = "LOCK";
const LAST_SYNC_FILE: &str = "last-sync";
const LAST_SYNC_TEMP: &str = "last-sync.tmp";
const CHECKOUT_DIR: &str = "worktree";
const CHECKOUT_MARKER: &str = ".weft-head";

/// Private checkout of the sync branch inside a git repository.
///
/// Opening acquires an exclusive advisory lock scoped to the checkout; a
/// second concurrent open fails fast with [`SyncError::AlreadyRunning`]
/// instead of interleaving cycles. The lock is released when the value is
/// dropped.
pub struct GitWorktree {
    repo: Repository,
    weft_dir: PathBuf,
    branch: String,
    remote_name: String,
    timeout: Duration,
    dirty: BTreeSet<IssueId>,
    _lock: File,
}

impl GitWorktree {
    /// Opens the sync checkout for the repository containing `path`.
    pub fn open(path: &Path, config: &SyncConfig) -> SyncResult<Self> {
        let repo = Repository::discover(path)?;
        let weft_dir = repo.path().join("weft");
        fs::create_dir_all(&weft_dir)?;

        let lock_path = weft_dir.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(SyncError::AlreadyRunning);
        }

        Ok(Self {
            repo,
            weft_dir,
            branch: config.branch.clone(),
            remote_name: config.remote.clone(),
            timeout: config.timeout,
            dirty: BTreeSet::new(),
            _lock: lock_file,
        })
    }

    /// Creates the sync branch with an empty store if it does not exist
    /// yet, and materializes the checkout.
    pub fn init(&mut self) -> SyncResult<Snapshot> {
        if self.local_tip()?.is_none() {
            let changes = ChangeSet {
                idmap: Some(weft_core::IdMap::new()),
                message: "weft(sync): initialize store".to_string(),
                ..ChangeSet::default()
            };
            self.commit(&changes)?;
        }
        self.checkout()
    }

    /// The path of the materialized private checkout.
    #[must_use]
    pub fn checkout_path(&self) -> PathBuf {
        self.weft_dir.join(CHECKOUT_DIR)
    }

    fn local_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    fn tracking_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.remote_name, self.branch)
    }

    fn resolve_ref(&self, name: &str) -> SyncResult<Option<Oid>> {
        match self.repo.refname_to_id(name) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn local_tip(&self) -> SyncResult<Option<Oid>> {
        self.resolve_ref(&self.local_ref())
    }

    fn tracking_tip(&self) -> SyncResult<Option<Oid>> {
        self.resolve_ref(&self.tracking_ref())
    }

    /// True if `commit` has `ancestor` in its history (or equals it).
    fn descends_from(&self, commit: Oid, ancestor: Oid) -> SyncResult<bool> {
        if commit == ancestor {
            return Ok(true);
        }
        Ok(self.repo.graph_descendant_of(commit, ancestor)?)
    }

    fn credential_callbacks(&self) -> git2::RemoteCallbacks<'_> {
        let cfg = self.repo.config().ok();
        let mut callbacks = git2::RemoteCallbacks::new();
        callbacks.credentials(move |url, username_from_url, allowed| {
            if allowed.is_ssh_key() {
                if let Some(user) = username_from_url {
                    return git2::Cred::ssh_key_from_agent(user);
                }
            }
            if allowed.is_user_pass_plaintext() {
                if let Some(cfg) = cfg.as_ref() {
                    if let Ok(cred) = git2::Cred::credential_helper(cfg, url, username_from_url) {
                        return Ok(cred);
                    }
                }
            }
            git2::Cred::default()
        });
        callbacks
    }

    /// Writes (or repairs) the on-disk materialization so it mirrors the
    /// tree at `tip`. Only files of the store layout are managed; foreign
    /// files are never touched, so repair cannot destroy data the
    /// checkout does not own.
    fn materialize(&self, tip: Oid) -> SyncResult<()> {
        let dir = self.checkout_path();
        let marker = dir.join(CHECKOUT_MARKER);

        if let Ok(existing) = fs::read_to_string(&marker) {
            if existing.trim() == tip.to_string() {
                return Ok(());
            }
            tracing::warn!(
                expected = %tip,
                found = existing.trim(),
                "sync checkout was stale; repairing"
            );
        }

        fs::create_dir_all(&dir)?;
        let blobs = layout::tree_blobs(&self.repo, tip)?;
        let mut live_paths: BTreeSet<PathBuf> = BTreeSet::new();

        for (path, blob_oid) in &blobs {
            let target = dir.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, self.repo.find_blob(*blob_oid)?.content())?;
            live_paths.insert(target);
        }

        // Drop owned files that fell out of the tree.
        for owned in [layout::RECORDS_DIR, layout::ATTIC_DIR] {
            remove_stale_files(&dir.join(owned), &live_paths)?;
        }

        let tmp = dir.join(format!("{CHECKOUT_MARKER}.tmp"));
        fs::write(&tmp, format!("{tip}\n"))?;
        fs::rename(&tmp, &marker)?;
        Ok(())
    }

    fn snapshot_of(&self, tip: Option<Oid>) -> SyncResult<Snapshot> {
        match tip {
            Some(oid) => layout::read_snapshot(&self.repo, oid),
            None => Ok(Snapshot::default()),
        }
    }

    fn is_rejection(message: &str) -> bool {
        let msg = message.to_lowercase();
        msg.contains("fast-forward")
            || msg.contains("fastforward")
            || msg.contains("fetch first")
            || msg.contains("cannot lock ref")
            || msg.contains("failed to update ref")
    }
}

impl Worktree for GitWorktree {
    fn checkout(&mut self) -> SyncResult<Snapshot> {
        match self.local_tip()? {
            Some(tip) => {
                self.materialize(tip)?;
                layout::read_snapshot(&self.repo, tip)
            }
            None => Ok(Snapshot::default()),
        }
    }

    fn fetch(&mut self) -> SyncResult<Option<Snapshot>> {
        let mut remote = match self.repo.find_remote(&self.remote_name) {
            Ok(remote) => remote,
            Err(_) => return Ok(None),
        };

        let mut callbacks = self.credential_callbacks();
        let deadline = Instant::now() + self.timeout;
        callbacks.transfer_progress(move |_| Instant::now() < deadline);

        let mut options = git2::FetchOptions::new();
        options.remote_callbacks(callbacks);
        let refspec = format!("+{}:{}", self.local_ref(), self.tracking_ref());

        if let Err(e) = remote.fetch(&[&refspec], Some(&mut options), None) {
            // A remote that simply has no sync branch yet is not a failure.
            let msg = e.message().to_lowercase();
            if !(msg.contains("not found") || msg.contains("couldn't find")) {
                return Err(SyncError::unreachable_retryable(e.message()));
            }
        }

        self.snapshot_of(self.tracking_tip()?).map(|snapshot| {
            if snapshot.tip.is_some() {
                Some(snapshot)
            } else {
                None
            }
        })
    }

    fn last_known_remote(&self) -> SyncResult<Option<Snapshot>> {
        match self.tracking_tip()? {
            Some(tip) => Ok(Some(layout::read_snapshot(&self.repo, tip)?)),
            None => Ok(None),
        }
    }

    fn base(&self) -> SyncResult<Option<Snapshot>> {
        let marker = self.weft_dir.join(LAST_SYNC_FILE);
        let Ok(content) = fs::read_to_string(&marker) else {
            return Ok(None);
        };
        let Ok(oid) = Oid::from_str(content.trim()) else {
            tracing::warn!("last-sync marker is unreadable; treating as never synced");
            return Ok(None);
        };
        if self.repo.find_commit(oid).is_err() {
            tracing::warn!(%oid, "last-sync marker points at a missing commit");
            return Ok(None);
        }
        Ok(Some(layout::read_snapshot(&self.repo, oid)?))
    }

    fn commit(&mut self, changes: &ChangeSet) -> SyncResult<CommitRef> {
        let parent = self.local_tip()?;
        let tracking = self.tracking_tip()?;

        let diverged = match (tracking, parent) {
            (Some(t), Some(p)) => !self.descends_from(p, t)?,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if changes.is_empty() && !diverged {
            if let Some(tip) = parent {
                return Ok(CommitRef::new(tip.to_string()));
            }
        }

        let baseline = match parent {
            Some(tip) => self.repo.find_commit(tip)?.tree()?,
            None => {
                let empty = self.repo.treebuilder(None)?.write()?;
                self.repo.find_tree(empty)?
            }
        };

        let mut builder = TreeUpdateBuilder::new();
        for (id, record) in &changes.records {
            let blob = self.repo.blob(&layout::record_bytes(record)?)?;
            builder.upsert(layout::record_path(id), blob, FileMode::Blob);
        }
        if let Some(idmap) = &changes.idmap {
            let blob = self.repo.blob(&layout::idmap_bytes(idmap)?)?;
            builder.upsert(layout::IDMAP_FILE, blob, FileMode::Blob);
        }
        for (key, entry) in &changes.attic {
            let blob = self.repo.blob(&layout::attic_bytes(entry)?)?;
            builder.upsert(layout::attic_path(key), blob, FileMode::Blob);
        }

        let tree_oid = builder.create_updated(&self.repo, &baseline)?;
        if tree_oid == baseline.id() && !diverged {
            if let Some(tip) = parent {
                return Ok(CommitRef::new(tip.to_string()));
            }
        }

        // If the merged tree is exactly what the remote already has and the
        // remote's history contains ours, fast-forward instead of minting a
        // commit; converged replicas land on identical tips.
        if let Some(t) = tracking {
            let tracking_commit = self.repo.find_commit(t)?;
            if tree_oid == tracking_commit.tree_id() {
                let can_fast_forward = match parent {
                    None => true,
                    Some(p) => self.descends_from(t, p)?,
                };
                if can_fast_forward {
                    match parent {
                        Some(expected) => {
                            self.repo.reference_matching(
                                &self.local_ref(),
                                t,
                                true,
                                expected,
                                "weft sync: fast-forward",
                            )?;
                        }
                        None => {
                            self.repo
                                .reference(&self.local_ref(), t, false, "weft sync: fast-forward")?;
                        }
                    }
                    self.materialize(t)?;
                    return Ok(CommitRef::new(t.to_string()));
                }
            }
        }

        let tree = self.repo.find_tree(tree_oid)?;

        let sig = Signature::now("weft", "weft@localhost")?;
        let mut parent_commits = Vec::new();
        if let Some(tip) = parent {
            parent_commits.push(self.repo.find_commit(tip)?);
        }
        if diverged {
            if let Some(t) = tracking {
                parent_commits.push(self.repo.find_commit(t)?);
            }
        }
        let parent_refs: Vec<_> = parent_commits.iter().collect();

        let commit_oid = self
            .repo
            .commit(None, &sig, &sig, &changes.message, &tree, &parent_refs)?;

        // Advance the branch ref, insisting it still points at the parent
        // we built on.
        match parent {
            Some(expected) => {
                self.repo
                    .reference_matching(
                        &self.local_ref(),
                        commit_oid,
                        true,
                        expected,
                        "weft sync: commit",
                    )
                    .map_err(|e| {
                        SyncError::WorktreeInconsistent(format!(
                            "sync branch moved during commit: {}",
                            e.message()
                        ))
                    })?;
            }
            None => {
                self.repo
                    .reference(&self.local_ref(), commit_oid, false, "weft sync: init")?;
            }
        }

        self.materialize(commit_oid)?;
        Ok(CommitRef::new(commit_oid.to_string()))
    }

    fn publish(&mut self, commit: &CommitRef) -> SyncResult<PublishOutcome> {
        let mut remote = match self.repo.find_remote(&self.remote_name) {
            Ok(remote) => remote,
            Err(_) => return Ok(PublishOutcome::Published),
        };

        let push_error: RefCell<Option<String>> = RefCell::new(None);
        {
            let mut callbacks = self.credential_callbacks();
            callbacks.push_update_reference(|_refname, status| {
                if let Some(message) = status {
                    *push_error.borrow_mut() = Some(message.to_string());
                }
                Ok(())
            });

            let mut options = git2::PushOptions::new();
            options.remote_callbacks(callbacks);
            let refspec = format!("{}:{}", self.local_ref(), self.local_ref());

            if let Err(e) = remote.push(&[&refspec], Some(&mut options)) {
                if e.code() == git2::ErrorCode::NotFastForward || Self::is_rejection(e.message()) {
                    return Ok(PublishOutcome::Rejected);
                }
                return Err(SyncError::unreachable_retryable(e.message()));
            }
        }

        if let Some(message) = push_error.into_inner() {
            if Self::is_rejection(&message) {
                return Ok(PublishOutcome::Rejected);
            }
            return Err(SyncError::unreachable_fatal(message));
        }

        // Keep the tracking ref in step with what we just published.
        let oid = Oid::from_str(commit.as_str())
            .map_err(|_| SyncError::WorktreeInconsistent("published a non-oid commit".into()))?;
        self.repo
            .reference(&self.tracking_ref(), oid, true, "weft sync: published")?;

        Ok(PublishOutcome::Published)
    }

    fn mark_synced(&mut self, commit: &CommitRef) -> SyncResult<()> {
        let tmp = self.weft_dir.join(LAST_SYNC_TEMP);
        fs::write(&tmp, format!("{commit}\n"))?;
        fs::rename(&tmp, self.weft_dir.join(LAST_SYNC_FILE))?;
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

/// Recursively removes files under `root` that are not in `live`, then
/// prunes emptied directories.
fn remove_stale_files(root: &Path, live: &BTreeSet<PathBuf>) -> SyncResult<()> {
    if !root.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_dir() {
            remove_stale_files(&path, live)?;
            if path.read_dir()?.next().is_none() {
                fs::remove_dir(&path)?;
            }
        } else if !live.contains(&path) {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
