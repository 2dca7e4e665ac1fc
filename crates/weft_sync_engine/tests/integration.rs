//! End-to-end sync scenarios over the in-memory worktree.

use std::collections::BTreeSet;
use std::sync::Arc;

use weft_core::{IssueId, IssuePayload, IssueRecord, IssueStatus, ResolutionReason};
use weft_sync_engine::{
    ChangeSet, CommitRef, MemoryRemote, MemoryWorktree, PublishOutcome, RetryConfig, Snapshot,
    SyncConfig, SyncEngine, SyncError, SyncMode, SyncPhase, Worktree,
};

fn quick_config() -> SyncConfig {
    SyncConfig::new().with_retry(
        RetryConfig::new(3).with_initial_delay(std::time::Duration::from_millis(1)),
    )
}

fn record(id: IssueId, title: &str, at_ms: u64) -> IssueRecord {
    IssueRecord::create(id, IssuePayload::new(title, at_ms))
}

#[test]
fn disjoint_edits_converge() {
    let remote = MemoryRemote::new();
    let a = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("a", Arc::clone(&remote)),
    );
    let b = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("b", Arc::clone(&remote)),
    );

    let id_a = IssueId::new();
    let id_b = IssueId::new();
    a.worktree().put_record(record(id_a, "From a", 1_000)).unwrap();
    b.worktree().put_record(record(id_b, "From b", 2_000)).unwrap();

    let summary_a = a.sync(SyncMode::Full).unwrap();
    assert_eq!(summary_a.pulled, 0);
    assert_eq!(summary_a.pushed, 1);
    assert!(summary_a.published);

    let summary_b = b.sync(SyncMode::Full).unwrap();
    assert_eq!(summary_b.pulled, 1);
    assert_eq!(summary_b.pushed, 1);
    assert!(summary_b.conflicts.is_empty());

    // a picks up b's record on its next cycle.
    let summary_a2 = a.sync(SyncMode::Full).unwrap();
    assert_eq!(summary_a2.pulled, 1);

    let rec_a = a.worktree().record(&id_b).unwrap();
    let rec_b = b.worktree().record(&id_b).unwrap();
    assert_eq!(rec_a.content_hash(), rec_b.content_hash());
    assert_eq!(
        a.worktree().record(&id_a).unwrap().content_hash(),
        b.worktree().record(&id_a).unwrap().content_hash()
    );
}

#[test]
fn concurrent_edit_resolves_by_timestamp_and_archives_loser() {
    let remote = MemoryRemote::new();
    let a = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("a", Arc::clone(&remote)),
    );
    let b = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("b", Arc::clone(&remote)),
    );

    // Replica a creates x (version 1) and shares it.
    let x = IssueId::new();
    a.worktree().put_record(record(x, "Fix bug", 1_000)).unwrap();
    a.sync(SyncMode::Full).unwrap();
    b.sync(SyncMode::Full).unwrap();

    // b updates status (version 2, later timestamp); a updates the
    // assignee (version 2, earlier timestamp).
    {
        let mut wt = b.worktree();
        let v1 = wt.record(&x).unwrap();
        let mut payload = v1.payload.clone();
        payload.status = IssueStatus::InProgress;
        payload.updated_at_ms = 5_000;
        wt.put_record(v1.with_next_version(payload)).unwrap();
    }
    {
        let mut wt = a.worktree();
        let v1 = wt.record(&x).unwrap();
        let mut payload = v1.payload.clone();
        payload.assignee = Some("mika".into());
        payload.updated_at_ms = 3_000;
        wt.put_record(v1.with_next_version(payload)).unwrap();
    }

    // a syncs first, then b hits the divergence and resolves it.
    a.sync(SyncMode::Full).unwrap();
    let summary = b.sync(SyncMode::Full).unwrap();
    assert_eq!(summary.conflicts.len(), 1);
    let conflict = &summary.conflicts[0];
    assert_eq!(conflict.issue_id, x);
    assert_eq!(conflict.reason, ResolutionReason::TimestampTiebreak);
    assert_eq!(conflict.merged_version, 3);
    assert_eq!(conflict.losing_version, 2);

    // a converges to the same result.
    a.sync(SyncMode::Full).unwrap();

    let rec_a = a.worktree().record(&x).unwrap();
    let rec_b = b.worktree().record(&x).unwrap();
    assert_eq!(rec_a.version, 3);
    assert_eq!(rec_a.content_hash(), rec_b.content_hash());
    // The later timestamp won: status carried, assignee lost.
    assert_eq!(rec_a.payload.status, IssueStatus::InProgress);
    assert_eq!(rec_a.payload.assignee, None);

    // Exactly one attic entry for the losing version-2 payload, mirrored
    // on both replicas with the same reason.
    let attic_a = a.list_attic(Some(x)).unwrap();
    let attic_b = b.list_attic(Some(x)).unwrap();
    assert_eq!(attic_a.len(), 1);
    assert_eq!(attic_b.len(), 1);
    assert_eq!(attic_a[0], attic_b[0]);
    assert_eq!(attic_a[0].superseded_version, 2);
    assert_eq!(attic_a[0].reason, ResolutionReason::TimestampTiebreak);
    assert_eq!(attic_a[0].payload.assignee, Some("mika".into()));
}

#[test]
fn second_sync_is_a_noop() {
    let remote = MemoryRemote::new();
    let a = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("a", Arc::clone(&remote)),
    );

    a.worktree()
        .put_record(record(IssueId::new(), "Fix bug", 1_000))
        .unwrap();
    let first = a.sync(SyncMode::Full).unwrap();
    assert!(!first.is_noop());

    let second = a.sync(SyncMode::Full).unwrap();
    assert!(second.is_noop());
    assert_eq!(second.commit, first.commit);
    assert!(a.list_attic(None).unwrap().is_empty());
}

#[test]
fn restore_attic_reproduces_the_exact_payload() {
    let remote = MemoryRemote::new();
    let a = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("a", Arc::clone(&remote)),
    );
    let b = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("b", Arc::clone(&remote)),
    );

    let x = IssueId::new();
    a.worktree().put_record(record(x, "Original", 1_000)).unwrap();
    a.sync(SyncMode::Full).unwrap();
    b.sync(SyncMode::Full).unwrap();

    for (engine, title, ts) in [(&a, "Edit from a", 3_000u64), (&b, "Edit from b", 5_000u64)] {
        let mut wt = engine.worktree();
        let v1 = wt.record(&x).unwrap();
        let mut payload = v1.payload.clone();
        payload.title = title.into();
        payload.updated_at_ms = ts;
        wt.put_record(v1.with_next_version(payload)).unwrap();
    }

    a.sync(SyncMode::Full).unwrap();
    let summary = b.sync(SyncMode::Full).unwrap();
    assert_eq!(summary.conflicts.len(), 1);
    let entry_id = summary.conflicts[0].attic_entry;

    let restored = b.restore_attic(entry_id).unwrap();
    assert_eq!(restored.version, 4);
    assert_eq!(restored.payload.title, "Edit from a");

    // The entry survives restoration.
    assert_eq!(b.list_attic(Some(x)).unwrap().len(), 1);

    // And the restored version propagates like any other edit.
    b.sync(SyncMode::Full).unwrap();
    a.sync(SyncMode::Full).unwrap();
    assert_eq!(a.worktree().record(&x).unwrap().payload.title, "Edit from a");
}

#[test]
fn pull_only_does_not_publish() {
    let remote = MemoryRemote::new();
    let a = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("a", Arc::clone(&remote)),
    );
    let b = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("b", Arc::clone(&remote)),
    );

    a.worktree()
        .put_record(record(IssueId::new(), "Shared", 1_000))
        .unwrap();
    a.sync(SyncMode::Full).unwrap();

    let local = IssueId::new();
    b.worktree().put_record(record(local, "Local only", 2_000)).unwrap();
    let remote_tip_before = remote.tip().unwrap();

    let summary = b.sync(SyncMode::PullOnly).unwrap();
    assert_eq!(summary.pulled, 1);
    assert_eq!(summary.pushed, 0);
    assert!(!summary.published);
    assert_eq!(remote.tip().unwrap(), remote_tip_before);

    // The unpublished local record still counts as ahead.
    let status = b.status().unwrap();
    assert_eq!(status.ahead, 1);
    assert_eq!(status.behind, 0);
    assert_eq!(status.pending_conflicts, 0);
}

#[test]
fn status_reports_ahead_and_behind() {
    let remote = MemoryRemote::new();
    let a = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("a", Arc::clone(&remote)),
    );
    let b = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("b", Arc::clone(&remote)),
    );

    a.worktree()
        .put_record(record(IssueId::new(), "From a", 1_000))
        .unwrap();
    a.sync(SyncMode::Full).unwrap();
    b.sync(SyncMode::Full).unwrap();

    // New remote work b has fetched but not integrated...
    a.worktree()
        .put_record(record(IssueId::new(), "More from a", 2_000))
        .unwrap();
    a.sync(SyncMode::Full).unwrap();
    // ...and local work b has not pushed.
    b.worktree()
        .put_record(record(IssueId::new(), "From b", 3_000))
        .unwrap();
    b.worktree().fetch().unwrap();

    let status = b.status().unwrap();
    assert_eq!(status.ahead, 1);
    assert_eq!(status.behind, 1);
    assert_eq!(status.pending_conflicts, 0);
}

/// Wraps a worktree and lets a rival replica publish right before every
/// delegated publish, simulating a remote that keeps advancing during the
/// resolution window.
struct RacingWorktree {
    inner: MemoryWorktree,
    rival: MemoryWorktree,
    races_left: u32,
    next_rival_ts: u64,
}

impl RacingWorktree {
    fn new(remote: &Arc<MemoryRemote>, races: u32) -> Self {
        Self {
            inner: MemoryWorktree::with_remote("inner", Arc::clone(remote)),
            rival: MemoryWorktree::with_remote("rival", Arc::clone(remote)),
            races_left: races,
            next_rival_ts: 10_000,
        }
    }
}

impl Worktree for RacingWorktree {
    fn checkout(&mut self) -> Result<Snapshot, SyncError> {
        self.inner.checkout()
    }
    fn fetch(&mut self) -> Result<Option<Snapshot>, SyncError> {
        self.inner.fetch()
    }
    fn last_known_remote(&self) -> Result<Option<Snapshot>, SyncError> {
        self.inner.last_known_remote()
    }
    fn base(&self) -> Result<Option<Snapshot>, SyncError> {
        self.inner.base()
    }
    fn commit(&mut self, changes: &ChangeSet) -> Result<CommitRef, SyncError> {
        self.inner.commit(changes)
    }
    fn publish(&mut self, commit: &CommitRef) -> Result<PublishOutcome, SyncError> {
        if self.races_left > 0 {
            self.races_left -= 1;
            self.rival.fetch()?;
            let tip = self
                .rival
                .put_record(record(IssueId::new(), "Rival edit", self.next_rival_ts))?;
            self.next_rival_ts += 1;
            assert_eq!(self.rival.publish(&tip)?, PublishOutcome::Published);
        }
        self.inner.publish(commit)
    }
    fn mark_synced(&mut self, commit: &CommitRef) -> Result<(), SyncError> {
        self.inner.mark_synced(commit)
    }
    fn note_mutation(&mut self, id: IssueId) {
        self.inner.note_mutation(id);
    }
    fn dirty_ids(&self) -> BTreeSet<IssueId> {
        self.inner.dirty_ids()
    }
}

#[test]
fn rejected_publish_refetches_and_converges() {
    let remote = MemoryRemote::new();
    let mut racing = RacingWorktree::new(&remote, 1);
    racing
        .inner
        .put_record(record(IssueId::new(), "Mine", 1_000))
        .unwrap();
    let engine = SyncEngine::new(quick_config(), racing);

    let summary = engine.sync(SyncMode::Full).unwrap();
    assert_eq!(summary.attempts, 2);
    assert!(summary.published);
    // The second pass pulled the rival's record.
    assert_eq!(summary.pulled, 1);
    assert_eq!(engine.stats().publish_retries, 1);
}

#[test]
fn contention_cap_surfaces_error() {
    let remote = MemoryRemote::new();
    let mut racing = RacingWorktree::new(&remote, u32::MAX);
    racing
        .inner
        .put_record(record(IssueId::new(), "Mine", 1_000))
        .unwrap();
    let config = quick_config().with_max_publish_attempts(3);
    let engine = SyncEngine::new(config, racing);

    let err = engine.sync(SyncMode::Full).unwrap_err();
    assert!(matches!(err, SyncError::Contention { attempts: 3 }));
    assert_eq!(engine.phase(), SyncPhase::Failed);
    assert!(engine.stats().last_error.is_some());
    // Failed is a restartable state.
    assert!(engine.phase().can_start_sync());
}

#[test]
fn push_only_fails_fast_on_contention() {
    let remote = MemoryRemote::new();
    let mut racing = RacingWorktree::new(&remote, 1);
    racing
        .inner
        .put_record(record(IssueId::new(), "Mine", 1_000))
        .unwrap();
    let engine = SyncEngine::new(quick_config(), racing);

    let err = engine.sync(SyncMode::PushOnly).unwrap_err();
    assert!(matches!(err, SyncError::Contention { attempts: 1 }));
}

#[test]
fn corrupt_record_is_skipped_and_reported() {
    let remote = MemoryRemote::new();
    let a = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("a", Arc::clone(&remote)),
    );
    let b = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("b", Arc::clone(&remote)),
    );

    let poisoned = IssueId::new();
    let healthy = IssueId::new();
    a.worktree().put_record(record(poisoned, "Poisoned", 1_000)).unwrap();
    a.worktree().put_record(record(healthy, "Healthy", 1_000)).unwrap();
    a.sync(SyncMode::Full).unwrap();
    b.sync(SyncMode::Full).unwrap();

    // The remote updates both records, but b can no longer parse its
    // local copy of one of them.
    {
        let mut wt = a.worktree();
        for id in [poisoned, healthy] {
            let v1 = wt.record(&id).unwrap();
            let mut payload = v1.payload.clone();
            payload.title = format!("{} v2", payload.title);
            payload.updated_at_ms = 2_000;
            wt.put_record(v1.with_next_version(payload)).unwrap();
        }
    }
    a.sync(SyncMode::Full).unwrap();

    b.worktree().poison(poisoned);
    let summary = b.sync(SyncMode::Full).unwrap();

    // The healthy record synced; the corrupt one was skipped, reported,
    // and its stored bytes left alone.
    assert_eq!(summary.pulled, 1);
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].id, Some(poisoned));
    assert_eq!(b.worktree().record(&healthy).unwrap().payload.title, "Healthy v2");
    assert_eq!(b.worktree().record(&poisoned).unwrap().payload.title, "Poisoned");
}

#[test]
fn interrupted_commit_leaves_pre_commit_state() {
    let remote = MemoryRemote::new();
    let a = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("a", Arc::clone(&remote)),
    );
    let b = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("b", Arc::clone(&remote)),
    );

    let x = IssueId::new();
    a.worktree().put_record(record(x, "Shared", 1_000)).unwrap();
    a.sync(SyncMode::Full).unwrap();

    let tip_before = b.worktree().local_tip();
    b.worktree().fail_next_commits(1);
    assert!(b.sync(SyncMode::Full).is_err());
    assert_eq!(b.phase(), SyncPhase::Failed);

    // Nothing was applied.
    assert_eq!(b.worktree().local_tip(), tip_before);
    assert!(b.worktree().record(&x).is_none());

    // A retried cycle starts clean and succeeds.
    let summary = b.sync(SyncMode::Full).unwrap();
    assert_eq!(summary.pulled, 1);
    assert_eq!(b.worktree().record(&x).unwrap().payload.title, "Shared");
}

#[test]
fn unreachable_remote_retries_then_surfaces() {
    let remote = MemoryRemote::new();
    let a = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("a", Arc::clone(&remote)),
    );
    a.worktree()
        .put_record(record(IssueId::new(), "Offline edit", 1_000))
        .unwrap();

    remote.set_unreachable(true);
    let err = a.sync(SyncMode::Full).unwrap_err();
    assert!(matches!(err, SyncError::Unreachable { .. }));
    assert_eq!(a.phase(), SyncPhase::Failed);

    remote.set_unreachable(false);
    let summary = a.sync(SyncMode::Full).unwrap();
    assert!(summary.published);
}

#[test]
fn no_remote_syncs_locally() {
    let a = SyncEngine::new(quick_config(), MemoryWorktree::new("solo"));
    a.worktree()
        .put_record(record(IssueId::new(), "Local life", 1_000))
        .unwrap();

    let summary = a.sync(SyncMode::Full).unwrap();
    assert!(summary.published);
    assert_eq!(summary.pushed, 1);
    assert!(a.sync(SyncMode::Full).unwrap().is_noop());
}

#[test]
fn display_id_collisions_converge_across_replicas() {
    use uuid::Uuid;

    let remote = MemoryRemote::new();
    let a = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("a", Arc::clone(&remote)),
    );
    let b = SyncEngine::new(
        quick_config(),
        MemoryWorktree::with_remote("b", Arc::clone(&remote)),
    );

    // Two ids sharing a 6-hex prefix, created on different replicas.
    let earlier = IssueId::from_uuid(Uuid::from_u128(0xabcdef00_0000_0000_0000_000000000001));
    let later = IssueId::from_uuid(Uuid::from_u128(0xabcdef00_0000_0000_0000_000000000002));
    a.worktree().put_record(record(earlier, "From a", 1_000)).unwrap();
    b.worktree().put_record(record(later, "From b", 2_000)).unwrap();

    a.sync(SyncMode::Full).unwrap();
    b.sync(SyncMode::Full).unwrap();
    a.sync(SyncMode::Full).unwrap();

    let map_a = a.worktree().checkout().unwrap().idmap;
    let map_b = b.worktree().checkout().unwrap().idmap;
    assert_eq!(map_a, map_b);
    // The earlier (time-sorted) id keeps the short alias.
    assert_eq!(map_a.display_of(&earlier).unwrap().as_str(), "wf-abcdef");
    assert_ne!(
        map_a.display_of(&later).unwrap(),
        map_a.display_of(&earlier).unwrap()
    );
}
