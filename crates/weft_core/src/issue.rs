//! Issue records.
//!
//! The payload schema is closed and versioned: every field an issue can
//! carry is declared here, so canonical hashing never has to special-case
//! unknown fields. Schema growth happens by adding optional fields with a
//! serde default, which keeps older serialized records parseable.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::ContentHash;
use crate::id::IssueId;

/// Workflow state of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    /// Issue is open and unclaimed.
    Open,
    /// Someone is actively working on the issue.
    InProgress,
    /// Issue is resolved.
    Closed,
}

impl Default for IssueStatus {
    fn default() -> Self {
        Self::Open
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Priority of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuePriority {
    /// Can wait indefinitely.
    Low,
    /// Default priority.
    Normal,
    /// Should be picked up soon.
    High,
    /// Drop everything.
    Urgent,
}

impl Default for IssuePriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for IssuePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        };
        write!(f, "{s}")
    }
}

/// The semantic payload of an issue record.
///
/// `updated_at_ms` is part of the payload contract, not incidental
/// bookkeeping: it is the last-writer-wins tie-break signal, so it is
/// hashed along with everything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuePayload {
    /// One-line summary.
    pub title: String,
    /// Workflow state.
    #[serde(default)]
    pub status: IssueStatus,
    /// Priority.
    #[serde(default)]
    pub priority: IssuePriority,
    /// Current assignee, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Free-form labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// Free-text description.
    #[serde(default)]
    pub body: String,
    /// Creation time, unix milliseconds.
    pub created_at_ms: u64,
    /// Last authored-change time, unix milliseconds.
    pub updated_at_ms: u64,
}

impl IssuePayload {
    /// Creates a payload with the given title and timestamps, everything
    /// else defaulted.
    #[must_use]
    pub fn new(title: impl Into<String>, created_at_ms: u64) -> Self {
        Self {
            title: title.into(),
            status: IssueStatus::default(),
            priority: IssuePriority::default(),
            assignee: None,
            labels: Vec::new(),
            body: String::new(),
            created_at_ms,
            updated_at_ms: created_at_ms,
        }
    }
}

/// A versioned issue record.
///
/// For a given internal id, `version` strictly increases with every
/// committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    /// Internal identifier, globally unique and time-sortable.
    pub id: IssueId,
    /// Monotonically increasing version counter.
    pub version: u64,
    /// Semantic payload.
    pub payload: IssuePayload,
}

impl IssueRecord {
    /// Creates a version-1 record for a freshly created issue.
    #[must_use]
    pub fn create(id: IssueId, payload: IssuePayload) -> Self {
        Self {
            id,
            version: 1,
            payload,
        }
    }

    /// The canonical content hash of this record's payload.
    #[must_use]
    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of(&self.payload)
    }

    /// Produces the successor record carrying `payload` at `version + 1`.
    #[must_use]
    pub fn with_next_version(&self, payload: IssuePayload) -> Self {
        Self {
            id: self.id,
            version: self.version + 1,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(title: &str) -> IssuePayload {
        IssuePayload::new(title, 1_700_000_000_000)
    }

    #[test]
    fn create_starts_at_version_one() {
        let rec = IssueRecord::create(IssueId::new(), payload("Fix bug"));
        assert_eq!(rec.version, 1);
    }

    #[test]
    fn next_version_increments() {
        let rec = IssueRecord::create(IssueId::new(), payload("Fix bug"));
        let mut updated = rec.payload.clone();
        updated.status = IssueStatus::Closed;
        updated.updated_at_ms += 1;
        let next = rec.with_next_version(updated);
        assert_eq!(next.version, 2);
        assert_eq!(next.id, rec.id);
        assert_ne!(next.content_hash(), rec.content_hash());
    }

    #[test]
    fn serde_roundtrip() {
        let mut p = payload("Fix bug");
        p.assignee = Some("mika".into());
        p.labels = vec!["backend".into()];
        let rec = IssueRecord::create(IssueId::new(), p);

        let json = serde_json::to_string_pretty(&rec).unwrap();
        let back: IssueRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn optional_fields_are_omitted() {
        let rec = IssueRecord::create(IssueId::new(), payload("Fix bug"));
        let json = serde_json::to_string(&rec).unwrap();
        assert!(!json.contains("assignee"));
        assert!(!json.contains("labels"));
    }

    #[test]
    fn missing_optional_fields_parse() {
        let json = format!(
            r#"{{"id":"{}","version":1,"payload":{{"title":"t","created_at_ms":1,"updated_at_ms":1}}}}"#,
            IssueId::new()
        );
        let rec: IssueRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(rec.payload.status, IssueStatus::Open);
        assert_eq!(rec.payload.priority, IssuePriority::Normal);
    }
}
