//! Attic entries: archived losing versions of resolved conflicts.
//!
//! Conflict resolution never discards an edit silently. The losing side of
//! every resolved divergence is written to the attic, keyed by internal id
//! and the superseded version, and is immutable once written. Restoration
//! is forward-only: it produces a new current-version mutation and leaves
//! the entry itself untouched.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::id::IssueId;
use crate::issue::IssuePayload;

/// Which resolution step decided a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionReason {
    /// One side carried a higher version counter.
    VersionSkew,
    /// Versions tied; the later payload timestamp won.
    TimestampTiebreak,
    /// Versions and timestamps tied; the lexicographically greater content
    /// hash won.
    HashTiebreak,
}

impl fmt::Display for ResolutionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::VersionSkew => "version-skew",
            Self::TimestampTiebreak => "timestamp-tiebreak",
            Self::HashTiebreak => "hash-tiebreak",
        };
        write!(f, "{s}")
    }
}

/// Durable key of an attic entry.
///
/// Archiving is idempotent under this key: re-archiving the same
/// superseded version of the same record is a no-op, which makes retried
/// sync cycles safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AtticEntryId {
    /// Internal id of the record the entry belongs to.
    pub issue_id: IssueId,
    /// The version that lost the resolution.
    pub superseded_version: u64,
}

impl fmt::Display for AtticEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.issue_id, self.superseded_version)
    }
}

/// An archived losing version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtticEntry {
    /// Internal id of the record.
    pub issue_id: IssueId,
    /// The version that was superseded.
    pub superseded_version: u64,
    /// Resolution time, unix milliseconds.
    ///
    /// Taken from the winning payload's own timestamp rather than a wall
    /// clock, so independently-resolving replicas write byte-identical
    /// entries.
    pub resolved_at_ms: u64,
    /// Which step of the resolution order decided the winner.
    pub reason: ResolutionReason,
    /// The losing payload, exactly as it was.
    pub payload: IssuePayload,
}

impl AtticEntry {
    /// The durable key of this entry.
    #[must_use]
    pub fn entry_id(&self) -> AtticEntryId {
        AtticEntryId {
            issue_id: self.issue_id,
            superseded_version: self.superseded_version,
        }
    }
}
