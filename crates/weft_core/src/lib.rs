//! # Weft Core
//!
//! Record model and pure building blocks for the weft sync layer.
//!
//! This crate provides:
//! - Issue records with a closed, versioned payload schema
//! - Time-sortable internal identifiers and short display identifiers
//! - The display-id mapping table
//! - Canonical content hashing for change detection and tie-breaking
//! - Attic entry types for archived (superseded) record versions
//!
//! Everything here is deterministic and side-effect free: the same inputs
//! produce the same hashes, the same display ids, and the same merged
//! mapping tables on every replica, with no coordination.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attic;
mod error;
mod hash;
mod id;
mod idmap;
mod issue;

pub use attic::{AtticEntry, AtticEntryId, ResolutionReason};
pub use error::{CoreError, CoreResult};
pub use hash::ContentHash;
pub use id::{DisplayId, IssueId, DISPLAY_PREFIX};
pub use idmap::IdMap;
pub use issue::{IssuePayload, IssuePriority, IssueRecord, IssueStatus};
