//! Attic commands: list and restore archived record versions.

use std::path::Path;
use std::str::FromStr;

use weft_core::{AtticEntryId, IssueId};
use weft_sync_engine::{GitWorktree, SyncEngine, Worktree};

use super::open_engine;

/// Lists attic entries, optionally filtered to one record.
pub fn list(path: &Path, id: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine(path)?;
    let issue = id.map(|raw| resolve_id(&engine, raw)).transpose()?;

    let entries = engine.list_attic(issue)?;
    if entries.is_empty() {
        println!("attic is empty");
        return Ok(());
    }

    let snapshot = engine.worktree().checkout()?;
    for entry in entries {
        let label = snapshot
            .idmap
            .display_of(&entry.issue_id)
            .map(|d| d.to_string())
            .unwrap_or_else(|| entry.issue_id.to_string());
        println!(
            "{label} v{} ({}) \"{}\"",
            entry.superseded_version, entry.reason, entry.payload.title
        );
    }
    Ok(())
}

/// Restores one archived payload as a new current version.
pub fn restore(path: &Path, id: &str, version: u64) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine(path)?;
    let issue_id = resolve_id(&engine, id)?;

    let restored = engine.restore_attic(AtticEntryId {
        issue_id,
        superseded_version: version,
    })?;

    println!(
        "✓ Restored v{} payload of {} as new version {}",
        version, id, restored.version
    );
    println!("  run `weft sync` to share it");
    Ok(())
}

/// Accepts either a display id or a full internal id.
fn resolve_id(
    engine: &SyncEngine<GitWorktree>,
    raw: &str,
) -> Result<IssueId, Box<dyn std::error::Error>> {
    if let Ok(id) = IssueId::from_str(raw) {
        return Ok(id);
    }
    let snapshot = engine.worktree().checkout()?;
    Ok(snapshot.idmap.resolve(raw)?)
}
