/// Common types used throughout meshdb.
///
/// This module defines the core data model: normalized paths, replica
/// identifiers, message identifiers, and the versioned value that is the
/// unit of storage and replication.
use crate::clock::VectorClock;
use crate::error::{MeshError, MeshResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Wall-clock timestamps order history entries and act as a secondary
/// hint; they never decide conflicts.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Opaque identifier for a replica, stable for the lifetime of that
/// replica.
///
/// Node ids participate in the deterministic tiebreak for concurrent
/// writes, which compares them lexicographically. They are generated once
/// at startup (random UUID, simple form) unless overridden through
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a new random node id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Create a node id from an explicit string (configuration override).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs; full ids are only needed on the wire.
        // Char-wise so an arbitrary peer-supplied id cannot panic.
        for c in self.0.chars().take(8) {
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque identifier uniquely tagging one PUT in flight.
///
/// Sixteen random bytes, hex-encoded. Used for de-duplication across
/// arbitrary topologies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a fresh random message id.
    pub fn random() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars().take(8) {
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

/// A normalized, slash-delimited address of a value in the tree.
///
/// Paths carry no leading or trailing slash and no empty or
/// whitespace-only segments. Two paths are in an ancestor relationship
/// when one segment list is a strict prefix of the other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Path {
    normalized: String,
}

impl Path {
    /// Parse and normalize a path.
    ///
    /// Leading and trailing slashes are stripped; empty or
    /// whitespace-only segments are rejected.
    pub fn parse(input: &str) -> MeshResult<Self> {
        let trimmed = input.trim_matches('/');
        if trimmed.is_empty() {
            return Err(MeshError::InvalidPath {
                path: input.to_string(),
                reason: "path has no segments".to_string(),
            });
        }

        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            if segment.trim().is_empty() {
                return Err(MeshError::InvalidPath {
                    path: input.to_string(),
                    reason: "path contains an empty or whitespace-only segment".to_string(),
                });
            }
            segments.push(segment);
        }

        Ok(Self {
            normalized: segments.join("/"),
        })
    }

    /// The normalized path string.
    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    /// The path's segments in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.normalized.split('/')
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// True when `self`'s segment list is a strict prefix of `other`'s.
    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        if self.normalized.len() >= other.normalized.len() {
            return false;
        }
        other.normalized.starts_with(&self.normalized)
            && other.normalized.as_bytes()[self.normalized.len()] == b'/'
    }

    /// True when the paths are equal or one is a segment-wise ancestor of
    /// the other. This is the relation subscriptions fire on.
    pub fn related(&self, other: &Path) -> bool {
        self == other || self.is_ancestor_of(other) || other.is_ancestor_of(self)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.normalized)
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Path::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// The stored unit: a value bundled with its origin, causal clock, and
/// wall-clock timestamp.
///
/// A `Null` value is a tombstone (logical delete). Tombstones are real
/// values: they participate in conflict resolution, are propagated, and
/// are never silently removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// The stored data; `Null` marks a tombstone.
    pub value: JsonValue,
    /// The node that first issued this write.
    pub origin: NodeId,
    /// Causal timestamp at commit.
    pub clock: VectorClock,
    /// Wall-clock milliseconds; history ordering and secondary hint only.
    pub timestamp: i64,
}

impl VersionedValue {
    /// Create a new versioned value.
    pub fn new(value: JsonValue, origin: NodeId, clock: VectorClock, timestamp: i64) -> Self {
        Self {
            value,
            origin,
            clock,
            timestamp,
        }
    }

    /// True when this entry is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_null()
    }
}
