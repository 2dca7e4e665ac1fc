//! Display-id mapping table.
//!
//! One durable table per store maps short display identifiers to internal
//! ids. Entries are created once at record creation and never reassigned.
//! The table is committed atomically with the records it maps; see the
//! sync engine's change-set handling.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};
use crate::id::{DisplayId, IssueId};

/// Shortest display-id prefix length, in hex characters.
const MIN_PREFIX: usize = 6;
/// Full internal-id length, in hex characters.
const MAX_PREFIX: usize = 32;
/// Prefix growth step on collision.
const PREFIX_STEP: usize = 2;

/// Bidirectional display-id ↔ internal-id table.
///
/// The serialized form is the internal→display map only; the reverse index
/// is rebuilt on load and duplicate display ids are rejected as malformed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<IssueId, DisplayId>")]
#[serde(into = "BTreeMap<IssueId, DisplayId>")]
pub struct IdMap {
    by_internal: BTreeMap<IssueId, DisplayId>,
    by_display: BTreeMap<String, IssueId>,
}

impl IdMap {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mapped records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_internal.len()
    }

    /// Returns true if no records are mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_internal.is_empty()
    }

    /// Allocates (or returns the existing) display id for `id`.
    ///
    /// Derivation is deterministic: the `wf-` prefix plus the first six hex
    /// characters of the internal id, extended two characters at a time
    /// while the shorter form is taken by a different record. Fails with
    /// [`CoreError::IdentifierExhausted`] only if the full-length form
    /// collides, which requires two equal internal ids.
    pub fn allocate(&mut self, id: IssueId) -> CoreResult<DisplayId> {
        if let Some(existing) = self.by_internal.get(&id) {
            return Ok(existing.clone());
        }

        let mut len = MIN_PREFIX;
        while len <= MAX_PREFIX {
            let candidate = DisplayId::derive(&id, len);
            match self.by_display.get(candidate.as_str()) {
                None => {
                    self.insert(id, candidate.clone());
                    return Ok(candidate);
                }
                Some(owner) if *owner == id => return Ok(candidate),
                Some(_) => len += PREFIX_STEP,
            }
        }
        Err(CoreError::IdentifierExhausted(id.to_string()))
    }

    /// Resolves a display id to its internal id.
    pub fn resolve(&self, display: &str) -> CoreResult<IssueId> {
        self.by_display
            .get(display)
            .copied()
            .ok_or_else(|| CoreError::UnknownIdentifier(display.to_string()))
    }

    /// The display id currently mapped to `id`, if any.
    #[must_use]
    pub fn display_of(&self, id: &IssueId) -> Option<&DisplayId> {
        self.by_internal.get(id)
    }

    /// Iterates mappings in internal-id (creation-time) order.
    pub fn iter(&self) -> impl Iterator<Item = (&IssueId, &DisplayId)> {
        self.by_internal.iter()
    }

    /// Deterministically merges two tables.
    ///
    /// The union is rebuilt in ascending internal-id order (internal ids
    /// are time-sortable, so this is registration order). When two internal
    /// ids claim the same display id, the earlier one keeps it and the
    /// later one is re-derived with a longer prefix. The operation is
    /// symmetric: `merge(a, b)` and `merge(b, a)` produce the same table,
    /// so independent replicas converge without coordination.
    #[must_use]
    pub fn merge(a: &IdMap, b: &IdMap) -> IdMap {
        let mut merged = IdMap::new();
        let ids: std::collections::BTreeSet<IssueId> = a
            .by_internal
            .keys()
            .chain(b.by_internal.keys())
            .copied()
            .collect();

        for id in ids {
            let mut candidates: Vec<&DisplayId> = [a.display_of(&id), b.display_of(&id)]
                .into_iter()
                .flatten()
                .collect();
            candidates.sort_by(|x, y| (x.as_str().len(), x.as_str()).cmp(&(y.as_str().len(), y.as_str())));
            candidates.dedup();

            let taken = candidates.iter().find_map(|candidate| {
                match merged.by_display.get(candidate.as_str()) {
                    None => Some((*candidate).clone()),
                    Some(owner) if *owner == id => Some((*candidate).clone()),
                    Some(_) => None,
                }
            });

            match taken {
                Some(display) => merged.insert(id, display),
                // Every recorded form is shadowed by an earlier record;
                // fall back to the standard derivation, which skips taken
                // prefixes by construction.
                None => {
                    let _ = merged.allocate(id);
                }
            }
        }
        merged
    }

    fn insert(&mut self, id: IssueId, display: DisplayId) {
        self.by_display.insert(display.as_str().to_string(), id);
        self.by_internal.insert(id, display);
    }
}

impl From<IdMap> for BTreeMap<IssueId, DisplayId> {
    fn from(map: IdMap) -> Self {
        map.by_internal
    }
}

impl TryFrom<BTreeMap<IssueId, DisplayId>> for IdMap {
    type Error = CoreError;

    fn try_from(by_internal: BTreeMap<IssueId, DisplayId>) -> Result<Self, Self::Error> {
        let mut by_display = BTreeMap::new();
        for (id, display) in &by_internal {
            if by_display.insert(display.as_str().to_string(), *id).is_some() {
                return Err(CoreError::Malformed(format!(
                    "duplicate display id in mapping table: {display}"
                )));
            }
        }
        Ok(Self {
            by_internal,
            by_display,
        })
    }
}
