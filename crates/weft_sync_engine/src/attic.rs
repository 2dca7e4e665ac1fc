//! Attic archiving, listing, and restoration.
//!
//! The attic holds the losing side of every resolved conflict. Entries
//! are immutable once written and are never deleted by normal operation;
//! restore creates a new current-version record mutation and leaves the
//! entry in place.

use std::collections::BTreeMap;

use weft_core::{AtticEntry, AtticEntryId, CoreError, IssueId, IssueRecord};

use crate::error::{SyncError, SyncResult};

/// Archives `entry`, returning its durable key.
///
/// Idempotent under `(issue id, superseded version)`: an entry already
/// present under the same key is kept as-is, so retried sync cycles do
/// not produce duplicates.
pub fn archive(
    attic: &mut BTreeMap<AtticEntryId, AtticEntry>,
    entry: AtticEntry,
) -> AtticEntryId {
    let key = entry.entry_id();
    attic.entry(key).or_insert(entry);
    key
}

/// Lists attic entries, optionally filtered to one record.
///
/// Entries come back oldest-first per record (superseded versions are
/// monotone), records ordered by internal id.
#[must_use]
pub fn list<'a>(
    attic: &'a BTreeMap<AtticEntryId, AtticEntry>,
    issue: Option<IssueId>,
) -> Vec<&'a AtticEntry> {
    attic
        .values()
        .filter(|entry| issue.is_none_or(|id| entry.issue_id == id))
        .collect()
}

/// Builds the record mutation that restores an archived payload.
///
/// Restoration is forward-only: the archived payload becomes a brand-new
/// version on top of the record's current version. The attic entry itself
/// is untouched.
pub fn restore(
    records: &BTreeMap<IssueId, IssueRecord>,
    entry: &AtticEntry,
) -> SyncResult<IssueRecord> {
    let current = records.get(&entry.issue_id).ok_or_else(|| {
        SyncError::Core(CoreError::UnknownIdentifier(entry.issue_id.to_string()))
    })?;

    Ok(current.with_next_version(entry.payload.clone()))
}
