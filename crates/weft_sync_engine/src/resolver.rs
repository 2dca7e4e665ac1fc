//! Conflict detection and deterministic last-writer-wins resolution.
//!
//! Every replica runs the same total order over the same two inputs and
//! reaches the same winner, with no coordination and no randomness:
//!
//! 1. higher version counter wins (`version-skew`)
//! 2. later payload timestamp wins (`timestamp-tiebreak`)
//! 3. lexicographically greater content hash wins (`hash-tiebreak`)
//!
//! The third step is arbitrary but reproducible; there is no field-level
//! priority, only whole-record LWW.

use std::cmp::Ordering;

use weft_core::{AtticEntry, ContentHash, IssueRecord, ResolutionReason};

/// Which side of a divergence a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// This replica's version.
    Local,
    /// The remote's version.
    Remote,
}

impl Side {
    fn flipped(self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }
}

/// Per-record classification against the last-synced base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffClass {
    /// Same content on both sides (or changed identically).
    Unchanged,
    /// Only this replica changed the record since the base.
    LocalOnly,
    /// Only the remote changed the record since the base.
    RemoteOnly,
    /// Both sides changed the record to different content.
    Divergent,
}

/// Classifies one record id given its base, local, and remote versions.
///
/// Classification is by content hash, so a record edited and then edited
/// back, or edited identically on both sides, counts as unchanged.
#[must_use]
pub fn classify(
    base: Option<&IssueRecord>,
    local: Option<&IssueRecord>,
    remote: Option<&IssueRecord>,
) -> DiffClass {
    let base_hash = base.map(IssueRecord::content_hash);
    match (local, remote) {
        (None, None) => DiffClass::Unchanged,
        (Some(_), None) => DiffClass::LocalOnly,
        (None, Some(_)) => DiffClass::RemoteOnly,
        (Some(l), Some(r)) => {
            let lh = l.content_hash();
            let rh = r.content_hash();
            if lh == rh {
                DiffClass::Unchanged
            } else {
                match base_hash {
                    Some(bh) if bh == lh => DiffClass::RemoteOnly,
                    Some(bh) if bh == rh => DiffClass::LocalOnly,
                    _ => DiffClass::Divergent,
                }
            }
        }
    }
}

/// Outcome of resolving one divergent record.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The merged record: the winning payload at
    /// `max(local_version, remote_version) + 1`.
    pub merged: IssueRecord,
    /// Which side supplied the winning payload.
    pub winner: Side,
    /// Which step of the total order decided it.
    pub reason: ResolutionReason,
    /// Archive entry for the losing payload, keyed by the losing version.
    pub archived: AtticEntry,
}

/// Resolves two divergent versions of the same record.
///
/// The caller guarantees both records share an internal id and differ in
/// content hash; records with equal hashes are not conflicts and never
/// reach the resolver.
#[must_use]
pub fn resolve(local: &IssueRecord, remote: &IssueRecord) -> Resolution {
    debug_assert_eq!(local.id, remote.id);

    let local_hash = local.content_hash();
    let remote_hash = remote.content_hash();
    debug_assert_ne!(local_hash, remote_hash);

    let (winner_side, reason) = decide(local, remote, &local_hash, &remote_hash);
    let (winner, loser) = match winner_side {
        Side::Local => (local, remote),
        Side::Remote => (remote, local),
    };

    let merged = IssueRecord {
        id: winner.id,
        version: local.version.max(remote.version) + 1,
        payload: winner.payload.clone(),
    };

    let archived = AtticEntry {
        issue_id: loser.id,
        superseded_version: loser.version,
        // The winner's own timestamp, not a wall clock: replicas that
        // resolve the same pair independently write identical entries.
        resolved_at_ms: winner.payload.updated_at_ms,
        reason,
        payload: loser.payload.clone(),
    };

    Resolution {
        merged,
        winner: winner_side,
        reason,
        archived,
    }
}

fn decide(
    local: &IssueRecord,
    remote: &IssueRecord,
    local_hash: &ContentHash,
    remote_hash: &ContentHash,
) -> (Side, ResolutionReason) {
    match local.version.cmp(&remote.version) {
        Ordering::Greater => (Side::Local, ResolutionReason::VersionSkew),
        Ordering::Less => (Side::Remote, ResolutionReason::VersionSkew),
        Ordering::Equal => {
            match local.payload.updated_at_ms.cmp(&remote.payload.updated_at_ms) {
                Ordering::Greater => (Side::Local, ResolutionReason::TimestampTiebreak),
                Ordering::Less => (Side::Remote, ResolutionReason::TimestampTiebreak),
                Ordering::Equal => match local_hash.cmp(remote_hash) {
                    Ordering::Greater => (Side::Local, ResolutionReason::HashTiebreak),
                    _ => (Side::Remote, ResolutionReason::HashTiebreak),
                },
            }
        }
    }
}
