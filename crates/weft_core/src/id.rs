//! Issue identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Prefix carried by every display identifier.
pub const DISPLAY_PREFIX: &str = "wf-";

/// Internal identifier for an issue record.
///
/// Issue ids are 128-bit UUIDv7 values, which makes them:
/// - Globally unique across replicas without coordination
/// - Time-sortable (creation order is reflected in byte order)
/// - Immutable once assigned, never reused
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueId(Uuid);

impl IssueId {
    /// Creates a new time-sortable issue id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates an issue id from an existing UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Converts to the underlying UUID.
    #[must_use]
    pub fn to_uuid(&self) -> Uuid {
        self.0
    }

    /// The 32-character lowercase hex form, without hyphens.
    ///
    /// Display identifiers are derived from prefixes of this form.
    #[must_use]
    pub fn hex(&self) -> String {
        self.0.simple().to_string()
    }

    /// Parses an issue id from its string form.
    pub fn parse(s: &str) -> CoreResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| CoreError::UnknownIdentifier(s.to_string()))
    }
}

impl Default for IssueId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IssueId({})", self.0)
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for IssueId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Uuid> for IssueId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<IssueId> for Uuid {
    fn from(id: IssueId) -> Self {
        id.0
    }
}

/// Short, human-facing alias for an issue record.
///
/// Display ids look like `wf-3fa9c1` and are resolved through the
/// [`IdMap`](crate::IdMap); they are allocated once at record creation and
/// never reassigned.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayId(String);

impl DisplayId {
    /// Wraps an already-derived display id string.
    ///
    /// Returns `None` if the string does not carry the `wf-` prefix.
    #[must_use]
    pub fn from_string(s: String) -> Option<Self> {
        if s.starts_with(DISPLAY_PREFIX) && s.len() > DISPLAY_PREFIX.len() {
            Some(Self(s))
        } else {
            None
        }
    }

    /// Derives the display id of `id` at the given prefix length.
    #[must_use]
    pub(crate) fn derive(id: &IssueId, prefix_len: usize) -> Self {
        let hex = id.hex();
        let take = prefix_len.min(hex.len());
        Self(format!("{DISPLAY_PREFIX}{}", &hex[..take]))
    }

    /// The display id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DisplayId({})", self.0)
    }
}

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_unique() {
        let id1 = IssueId::new();
        let id2 = IssueId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn new_is_time_sortable() {
        // UUIDv7 embeds a millisecond timestamp in the high bits, so ids
        // created in sequence compare in creation order.
        let earlier = IssueId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let later = IssueId::new();
        assert!(earlier < later);
    }

    #[test]
    fn parse_roundtrip() {
        let id = IssueId::new();
        let parsed = IssueId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(IssueId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn hex_has_no_hyphens() {
        let id = IssueId::new();
        let hex = id.hex();
        assert_eq!(hex.len(), 32);
        assert!(!hex.contains('-'));
    }

    #[test]
    fn display_derivation() {
        let id = IssueId::from_uuid(Uuid::from_u128(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef));
        assert_eq!(DisplayId::derive(&id, 6).as_str(), "wf-012345");
        assert_eq!(DisplayId::derive(&id, 8).as_str(), "wf-01234567");
    }

    #[test]
    fn display_from_string_requires_prefix() {
        assert!(DisplayId::from_string("wf-abc123".into()).is_some());
        assert!(DisplayId::from_string("bd-abc123".into()).is_none());
        assert!(DisplayId::from_string("wf-".into()).is_none());
    }

    #[test]
    fn serde_transparent() {
        let id = IssueId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
