//! Sync command implementation.

use std::path::Path;

use weft_sync_engine::{SyncMode, SyncSummary};

use super::open_engine;

/// Runs the sync command.
pub fn run(path: &Path, pull_only: bool, push_only: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mode = if pull_only {
        SyncMode::PullOnly
    } else if push_only {
        SyncMode::PushOnly
    } else {
        SyncMode::Full
    };

    let engine = open_engine(path)?;
    let summary = engine.sync_with_retry(mode)?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &SyncSummary) {
    if summary.is_noop() {
        println!("✓ Already in sync");
        return;
    }

    println!(
        "✓ Synced: {} pulled, {} pushed, {} conflicts resolved",
        summary.pulled,
        summary.pushed,
        summary.conflicts.len()
    );

    for conflict in &summary.conflicts {
        let label = conflict
            .display_id
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| conflict.issue_id.to_string());
        println!(
            "  resolved {label}: v{} superseded v{} ({}) -> attic {}",
            conflict.merged_version, conflict.losing_version, conflict.reason, conflict.attic_entry
        );
    }

    for skipped in &summary.skipped {
        println!("  ! skipped {}: {}", skipped.path, skipped.message);
    }

    if summary.attempts > 1 {
        println!("  (remote advanced {} time(s) mid-cycle)", summary.attempts - 1);
    }
    if !summary.published {
        println!("  local changes not published (pull-only)");
    }
}
