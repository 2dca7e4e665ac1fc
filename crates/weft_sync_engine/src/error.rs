//! Error types for the sync engine.

use thiserror::Error;
use weft_core::CoreError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Per-record problems (a payload that fails to parse, a mapping lookup
/// that misses) are accumulated into the sync summary and do not surface
/// here; this taxonomy covers the structural failures that abort a cycle.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote could not be reached (network or auth failure).
    #[error("remote unreachable: {message}")]
    Unreachable {
        /// Error message from the transport.
        message: String,
        /// Whether the attempt can be retried with backoff.
        retryable: bool,
    },

    /// The publish-rejection retry cap was exceeded; the remote kept
    /// advancing while we resolved. Re-running sync converges.
    #[error("publish contention: remote advanced during {attempts} attempts; re-run sync")]
    Contention {
        /// How many full cycles were attempted.
        attempts: u32,
    },

    /// The private checkout is in a state one automatic repair pass could
    /// not fix.
    #[error("sync checkout inconsistent: {0}")]
    WorktreeInconsistent(String),

    /// Another sync cycle already holds this checkout's lock.
    #[error("sync already in progress for this repository")]
    AlreadyRunning,

    /// The cycle was cancelled between phases.
    #[error("sync cancelled")]
    Cancelled,

    /// A sync was requested while the engine was mid-cycle.
    #[error("sync engine busy: currently {phase}")]
    Busy {
        /// The phase the engine was in.
        phase: String,
    },

    /// Core record/identifier error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Underlying git error.
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// I/O error touching the private checkout.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a retryable unreachable-remote error.
    pub fn unreachable_retryable(message: impl Into<String>) -> Self {
        Self::Unreachable {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable unreachable-remote error.
    pub fn unreachable_fatal(message: impl Into<String>) -> Self {
        Self::Unreachable {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the failed attempt may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Unreachable { retryable: true, .. })
    }
}
