/// The persistent store beneath the replication engine.
///
/// The engine is deliberately agnostic about where versioned values
/// live; it talks to a minimal put/get/scan/del contract and is the
/// store's single writer. Each operation must be durable before it
/// returns. Scan takes a path prefix and uses a half-open upper bound at
/// `prefix + U+FFFF`; no particular iteration order is promised.
///
/// [`MemoryStore`] is the bundled implementation, backed by a DashMap
/// for lock-free concurrent reads. Persistent backends plug in behind
/// the same trait.
use crate::error::{MeshError, MeshResult};
use crate::types::{Path, VersionedValue};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Contract for the store adapter.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read the versioned value at a path, if any.
    async fn get(&self, path: &Path) -> MeshResult<Option<VersionedValue>>;

    /// Write a versioned value; durable before returning.
    async fn put(&self, path: &Path, value: VersionedValue) -> MeshResult<()>;

    /// Physically remove an entry.
    ///
    /// Logical deletion goes through a tombstone `put`; this is for
    /// compaction and administrative use only.
    async fn del(&self, path: &Path) -> MeshResult<()>;

    /// All entries whose path starts with `prefix` (`""` scans the whole
    /// key range). Upper bound is half-open at `prefix + U+FFFF`.
    async fn scan(&self, prefix: &str) -> MeshResult<Vec<(Path, VersionedValue)>>;

    /// Flush any buffered writes.
    async fn flush(&self) -> MeshResult<()>;

    /// Release the store; subsequent operations fail.
    async fn close(&self) -> MeshResult<()>;
}

/// In-memory store used by tests, demos, and as the default backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, VersionedValue>,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries (tombstones included).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_open(&self) -> MeshResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MeshError::Store("store is closed".to_string()));
        }
        Ok(())
    }

    fn in_range(key: &str, prefix: &str) -> bool {
        // Half-open range [prefix, prefix + U+FFFF).
        if !key.starts_with(prefix) {
            return false;
        }
        let mut upper = prefix.to_string();
        upper.push('\u{ffff}');
        key < upper.as_str()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, path: &Path) -> MeshResult<Option<VersionedValue>> {
        self.check_open()?;
        Ok(self.entries.get(path.as_str()).map(|e| e.value().clone()))
    }

    async fn put(&self, path: &Path, value: VersionedValue) -> MeshResult<()> {
        self.check_open()?;
        self.entries.insert(path.as_str().to_string(), value);
        Ok(())
    }

    async fn del(&self, path: &Path) -> MeshResult<()> {
        self.check_open()?;
        self.entries.remove(path.as_str());
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> MeshResult<Vec<(Path, VersionedValue)>> {
        self.check_open()?;
        let mut out = Vec::new();
        for entry in self.entries.iter() {
            if Self::in_range(entry.key(), prefix) {
                // Keys were normalized on the way in; parse cannot fail.
                if let Ok(path) = Path::parse(entry.key()) {
                    out.push((path, entry.value().clone()));
                }
            }
        }
        Ok(out)
    }

    async fn flush(&self) -> MeshResult<()> {
        self.check_open()
    }

    async fn close(&self) -> MeshResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
