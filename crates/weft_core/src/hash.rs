//! Canonical content hashing.
//!
//! The content hash decides whether two record versions are "the same
//! edit" and breaks the final tie during conflict resolution, so it must
//! be identical on every platform for semantically equal payloads. Rather
//! than hashing a serialized rendering (which would couple the digest to
//! field ordering and formatting), fields are fed to the hasher in a fixed
//! order with explicit domain separators, after normalization:
//!
//! - labels are sorted and deduplicated
//! - text is converted to `\n` line endings, per-line trailing whitespace
//!   and trailing blank lines are dropped
//! - absent optional fields contribute a distinct absence marker

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::issue::IssuePayload;

/// A 256-bit canonical content digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Computes the canonical hash of a payload.
    ///
    /// Pure function of its input: no clocks, no allocation-order effects.
    #[must_use]
    pub fn of(payload: &IssuePayload) -> Self {
        let mut h = Sha256::new();

        field(&mut h, b"title", normalize_line(&payload.title).as_bytes());
        field(&mut h, b"status", &[payload.status as u8]);
        field(&mut h, b"priority", &[payload.priority as u8]);
        match &payload.assignee {
            Some(a) => field(&mut h, b"assignee", normalize_line(a).as_bytes()),
            None => absent(&mut h, b"assignee"),
        }

        let mut labels: Vec<String> = payload
            .labels
            .iter()
            .map(|l| normalize_line(l))
            .filter(|l| !l.is_empty())
            .collect();
        labels.sort();
        labels.dedup();
        h.update(b"labels");
        h.update((labels.len() as u64).to_be_bytes());
        for label in &labels {
            field(&mut h, b"label", label.as_bytes());
        }

        field(&mut h, b"body", normalize_text(&payload.body).as_bytes());
        field(&mut h, b"created", &payload.created_at_ms.to_be_bytes());
        field(&mut h, b"updated", &payload.updated_at_ms.to_be_bytes());

        Self(h.finalize().into())
    }

    /// Wraps raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex form for log lines and summaries.
    #[must_use]
    pub fn short(&self) -> String {
        let hex = self.to_string();
        hex[..8.min(hex.len())].to_string()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({self})")
    }
}

impl Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.len() != 64 {
            return Err(serde::de::Error::custom("content hash must be 64 hex chars"));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = hex_val(chunk[0]).ok_or_else(|| serde::de::Error::custom("invalid hex"))?;
            let lo = hex_val(chunk[1]).ok_or_else(|| serde::de::Error::custom("invalid hex"))?;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Feeds one named field with a length prefix, so adjacent fields can
/// never alias each other.
fn field(h: &mut Sha256, name: &[u8], value: &[u8]) {
    h.update(name);
    h.update([0x1f]);
    h.update((value.len() as u64).to_be_bytes());
    h.update(value);
}

/// Marks an absent optional field, distinct from any present value.
fn absent(h: &mut Sha256, name: &[u8]) {
    h.update(name);
    h.update([0x00]);
}

/// Normalizes a single-line value: unified whitespace trim.
fn normalize_line(s: &str) -> String {
    s.trim().to_string()
}

/// Normalizes multi-line text: `\r\n` and bare `\r` become `\n`, trailing
/// whitespace is stripped per line, trailing blank lines are dropped.
fn normalize_text(s: &str) -> String {
    let unified = s.replace("\r\n", "\n").replace('\r', "\n");
    let mut out: Vec<&str> = unified.lines().map(|l| l.trim_end()).collect();
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out.join("\n")
}
