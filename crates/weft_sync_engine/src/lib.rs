//! # Weft Sync Engine
//!
//! Peer-to-peer synchronization for weft issue records, using git purely
//! as transport and durable log, never as the conflict-resolution
//! mechanism.
//!
//! This crate provides:
//! - Sync state machine (idle → fetching → diffing → resolving →
//!   committing → publishing)
//! - Three-way record diffing against the last-synced base
//! - Deterministic last-writer-wins conflict resolution
//! - The attic: a durable archive of every losing edit
//! - A private checkout of the dedicated sync branch, isolated from the
//!   user's working tree
//! - Retry with exponential backoff for transient transport failures
//!
//! ## Architecture
//!
//! The orchestrator drives a [`Worktree`] through the cycle: fetch the
//! remote tip, classify every record as unchanged / local-only /
//! remote-only / divergent, resolve divergent records deterministically,
//! commit the merged state as one atomic unit, and fast-forward the
//! remote ref. A rejected publish means the remote advanced concurrently;
//! the cycle re-fetches and re-diffs, converging in a bounded number of
//! iterations because resolution is deterministic.
//!
//! ## Key Invariants
//!
//! - A cycle either fully commits or fully does not
//! - Every resolved conflict leaves exactly one attic entry for the loser
//! - Two replicas resolving the same divergence pick the same winner
//! - Corrupt records are skipped and reported, never fatal, never touched

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attic;
mod config;
mod error;
mod git;
mod resolver;
mod state;
mod worktree;

pub use attic::{archive, list, restore};
pub use config::{RetryConfig, SyncConfig, DEFAULT_BRANCH, DEFAULT_REMOTE};
pub use error::{SyncError, SyncResult};
pub use git::GitWorktree;
pub use resolver::{classify, resolve, DiffClass, Resolution, Side};
pub use state::{
    ConflictReport, SyncEngine, SyncMode, SyncPhase, SyncStats, SyncStatus, SyncSummary,
};
pub use worktree::{
    ChangeSet, CommitRef, CorruptEntry, MemoryRemote, MemoryWorktree, PublishOutcome, Snapshot,
    Worktree,
};
