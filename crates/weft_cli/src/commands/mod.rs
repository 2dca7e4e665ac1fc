//! CLI command implementations.

pub mod attic;
pub mod init;
pub mod status;
pub mod sync;

use std::path::Path;
use weft_sync_engine::{GitWorktree, SyncConfig, SyncEngine};

/// Opens the sync engine for the repository containing `path`.
pub(crate) fn open_engine(
    path: &Path,
) -> Result<SyncEngine<GitWorktree>, Box<dyn std::error::Error>> {
    let config = SyncConfig::new();
    let worktree = GitWorktree::open(path, &config)?;
    Ok(SyncEngine::new(config, worktree))
}
