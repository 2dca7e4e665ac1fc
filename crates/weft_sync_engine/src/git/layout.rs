//! On-branch layout of the sync store.
//!
//! The sync branch's tree holds one JSON file per record, the mapping
//! table, and the attic:
//!
//! ```text
//! records/<internal-id>.json
//! idmap.json
//! attic/<internal-id>/<superseded-version>.json
//! ```
//!
//! Records and attic entries tolerate per-file corruption (a file that
//! fails to parse is reported and left untouched); the mapping table is
//! structural and a corrupt one aborts the cycle.

use git2::{ObjectType, Oid, Repository, TreeWalkMode, TreeWalkResult};
use std::str::FromStr;

use weft_core::{AtticEntry, AtticEntryId, IdMap, IssueId, IssueRecord};

use crate::error::{SyncError, SyncResult};
use crate::worktree::{CommitRef, CorruptEntry, Snapshot};

pub(crate) const RECORDS_DIR: &str = "records";
pub(crate) const IDMAP_FILE: &str = "idmap.json";
pub(crate) const ATTIC_DIR: &str = "attic";

/// Tree path of a record file.
pub(crate) fn record_path(id: &IssueId) -> String {
    format!("{RECORDS_DIR}/{id}.json")
}

/// Tree path of an attic entry. Versions are zero-padded so byte order
/// matches numeric order.
pub(crate) fn attic_path(key: &AtticEntryId) -> String {
    format!(
        "{ATTIC_DIR}/{}/{:010}.json",
        key.issue_id, key.superseded_version
    )
}

/// Serializes a record for storage.
pub(crate) fn record_bytes(record: &IssueRecord) -> SyncResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(record).map_err(weft_core::CoreError::from)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Serializes the mapping table for storage.
pub(crate) fn idmap_bytes(idmap: &IdMap) -> SyncResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(idmap).map_err(weft_core::CoreError::from)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Serializes an attic entry for storage.
pub(crate) fn attic_bytes(entry: &AtticEntry) -> SyncResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(entry).map_err(weft_core::CoreError::from)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Every blob in a commit's tree, as `(path, blob oid)` pairs.
pub(crate) fn tree_blobs(repo: &Repository, commit: Oid) -> SyncResult<Vec<(String, Oid)>> {
    let tree = repo.find_commit(commit)?.tree()?;
    let mut blobs = Vec::new();
    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            if let Some(name) = entry.name() {
                blobs.push((format!("{root}{name}"), entry.id()));
            }
        }
        TreeWalkResult::Ok
    })?;
    Ok(blobs)
}

/// Loads the full store state at a commit.
///
/// Unparseable record and attic files become [`CorruptEntry`] reports and
/// their bytes stay untouched on the branch; an unparseable mapping table
/// is a structural failure.
pub(crate) fn read_snapshot(repo: &Repository, commit: Oid) -> SyncResult<Snapshot> {
    let mut snapshot = Snapshot {
        tip: Some(CommitRef::new(commit.to_string())),
        ..Snapshot::default()
    };

    for (path, blob_oid) in tree_blobs(repo, commit)? {
        let content = repo.find_blob(blob_oid)?.content().to_vec();

        if path == IDMAP_FILE {
            snapshot.idmap = serde_json::from_slice(&content).map_err(|e| {
                SyncError::WorktreeInconsistent(format!("mapping table failed to parse: {e}"))
            })?;
        } else if let Some(name) = path.strip_prefix(&format!("{RECORDS_DIR}/")) {
            let file_id = name
                .strip_suffix(".json")
                .and_then(|stem| IssueId::from_str(stem).ok());
            match parse_record(&content, file_id) {
                Ok(record) => {
                    snapshot.records.insert(record.id, record);
                }
                Err(message) => snapshot.corrupt.push(CorruptEntry {
                    path,
                    id: file_id,
                    message,
                }),
            }
        } else if let Some(rest) = path.strip_prefix(&format!("{ATTIC_DIR}/")) {
            let file_id = rest
                .split('/')
                .next()
                .and_then(|stem| IssueId::from_str(stem).ok());
            match serde_json::from_slice::<AtticEntry>(&content) {
                Ok(entry) => {
                    snapshot.attic.insert(entry.entry_id(), entry);
                }
                Err(e) => snapshot.corrupt.push(CorruptEntry {
                    path,
                    id: file_id,
                    message: e.to_string(),
                }),
            }
        }
        // Anything else in the tree is not ours; leave it alone.
    }

    Ok(snapshot)
}

fn parse_record(content: &[u8], file_id: Option<IssueId>) -> Result<IssueRecord, String> {
    let record: IssueRecord = serde_json::from_slice(content).map_err(|e| e.to_string())?;
    match file_id {
        Some(id) if id != record.id => Err(format!(
            "record id {} does not match its filename ({id})",
            record.id
        )),
        _ => Ok(record),
    }
}
