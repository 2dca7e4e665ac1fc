//! Init command implementation.

use std::path::Path;

use weft_sync_engine::{GitWorktree, SyncConfig};

/// Runs the init command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = SyncConfig::new();
    let mut worktree = GitWorktree::open(path, &config)?;
    let snapshot = worktree.init()?;

    println!("✓ Initialized sync branch '{}'", config.branch);
    println!("  private checkout: {}", worktree.checkout_path().display());
    println!("  records: {}", snapshot.records.len());
    Ok(())
}
