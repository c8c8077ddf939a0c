/// Vector clocks for causal ordering.
///
/// A vector clock maps each replica's node id to a monotonic counter and
/// captures the happens-before relation between writes across the mesh.
/// Comparison yields one of four outcomes; merge is the pointwise maximum
/// and is commutative, associative, and idempotent, so counters never
/// decrease no matter how often clocks are exchanged.
///
/// The serialized form is a flat map `{ node_id: counter }`.
/// Deserialization is defensive: non-numeric or negative counters are
/// coerced to 0 rather than rejecting the whole message, because clocks
/// arrive from arbitrary peers.
use crate::types::NodeId;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Every entry of `self` ≤ the other's, at least one strictly less.
    Before,
    /// Every entry of `self` ≥ the other's, at least one strictly greater.
    After,
    /// Strictly-less and strictly-greater pairs both present.
    Concurrent,
    /// All entries equal.
    Identical,
}

/// The same four outcomes under the names conflict resolution uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dominance {
    /// `self` happened before the other clock.
    Dominated,
    /// `self` happened after the other clock.
    Dominates,
    /// The clocks are equal.
    Identical,
    /// Neither clock dominates.
    Concurrent,
}

/// Which side a deterministic tiebreak selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    /// The receiver's side (`self` in the comparison).
    Local,
    /// The other side.
    Remote,
}

/// Causal timestamp mapping node ids to counters.
///
/// Missing entries are treated as 0 everywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorClock {
    entries: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    /// Create a new empty vector clock.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// The counter for a node (0 when absent).
    pub fn get(&self, id: &NodeId) -> u64 {
        self.entries.get(id).copied().unwrap_or(0)
    }

    /// Increment the counter for a node.
    pub fn increment(&mut self, id: &NodeId) {
        let entry = self.entries.entry(id.clone()).or_insert(0);
        *entry += 1;
    }

    /// Ensure an entry exists for `id`, inserting 0 when absent.
    ///
    /// Keeping the clock complete over every observed node id prevents
    /// sparse clocks from producing spurious `Concurrent` results.
    pub fn ensure(&mut self, id: &NodeId) {
        self.entries.entry(id.clone()).or_insert(0);
    }

    /// Merge another clock into this one: pointwise maximum over the
    /// union of keys.
    pub fn merge(&mut self, other: &VectorClock) {
        for (id, &counter) in &other.entries {
            let entry = self.entries.entry(id.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// Immutable merge.
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Compare two clocks over the union of their keys.
    ///
    /// Short-circuits to `Concurrent` as soon as both a strict-less and a
    /// strict-greater pair have been seen.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut has_less = false;
        let mut has_greater = false;

        for id in self.entries.keys().chain(other.entries.keys()) {
            let ours = self.get(id);
            let theirs = other.get(id);
            if ours < theirs {
                has_less = true;
            } else if ours > theirs {
                has_greater = true;
            }
            if has_less && has_greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (has_less, has_greater) {
            (false, false) => ClockOrdering::Identical,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// The dominance relation: `compare` under the names conflict
    /// resolution uses.
    pub fn dominance(&self, other: &VectorClock) -> Dominance {
        match self.compare(other) {
            ClockOrdering::Before => Dominance::Dominated,
            ClockOrdering::After => Dominance::Dominates,
            ClockOrdering::Identical => Dominance::Identical,
            ClockOrdering::Concurrent => Dominance::Concurrent,
        }
    }

    /// Resolve a comparison to a single side, deterministically across
    /// the whole mesh.
    ///
    /// Dominance decides when it can; identical clocks canonically select
    /// the local side; concurrent clocks fall back to the side whose node
    /// id compares lexicographically greater.
    pub fn deterministic_winner(
        &self,
        other: &VectorClock,
        self_id: &NodeId,
        other_id: &NodeId,
    ) -> Winner {
        match self.dominance(other) {
            Dominance::Dominates | Dominance::Identical => Winner::Local,
            Dominance::Dominated => Winner::Remote,
            Dominance::Concurrent => {
                if self_id > other_id {
                    Winner::Local
                } else {
                    Winner::Remote
                }
            }
        }
    }

    /// Node ids present in this clock.
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.entries.keys()
    }

    /// True when no entries are present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Serialize for VectorClock {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (id, counter) in &self.entries {
            map.serialize_entry(id.as_str(), counter)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for VectorClock {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Counters arrive from peers; coerce anything non-numeric or
        // negative to 0 instead of rejecting the message.
        let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        let mut entries = BTreeMap::new();
        for (id, value) in raw {
            let counter = value.as_u64().unwrap_or(0);
            entries.insert(NodeId::new(id), counter);
        }
        Ok(Self { entries })
    }
}
