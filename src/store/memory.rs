//! In-process reference backend.
//!
//! Keeps entries in a map shared by every accessor the store hands out, with
//! an optional JSON checkpoint file rewritten on each mutation. Tests and
//! embedded callers get restart behavior without an external database: reopen
//! the same checkpoint path and previously written cursors are back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::backend::{StateStore, StoreAccessor, StoreError};

/// In-process [`StateStore`] with optional checkpoint persistence.
///
/// All accessors returned by [`StateStore::access`] share one entry map, so a
/// manager re-initialized against the same store observes previously written
/// cursors. With a checkpoint path the map is loaded once at open and
/// rewritten atomically (sibling temp file, then rename) on every mutation.
pub struct MemoryStateStore {
    inner: Arc<StoreInner>,
    cleanup_interval: Duration,
}

struct StoreInner {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    checkpoint: Option<PathBuf>,
}

impl MemoryStateStore {
    /// Create a purely in-memory store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: Mutex::new(BTreeMap::new()),
                checkpoint: None,
            }),
            cleanup_interval: Duration::ZERO,
        }
    }

    /// Create a store backed by a checkpoint file.
    ///
    /// An existing checkpoint is loaded up front; a missing file starts the
    /// store empty.
    ///
    /// # Errors
    ///
    /// Returns an error when an existing checkpoint cannot be read or parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StoreError::Io(e)),
        };

        Ok(Self {
            inner: Arc::new(StoreInner {
                entries: Mutex::new(entries),
                checkpoint: Some(path),
            }),
            cleanup_interval: Duration::ZERO,
        })
    }

    /// Advertise a preferred sweep interval to the manager.
    ///
    /// The default is zero, which lets the manager fall back to its own
    /// interval.
    #[must_use]
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.inner.lock_entries().len()
    }

    /// True when no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStateStore")
            .field("entries", &self.len())
            .field("checkpoint", &self.inner.checkpoint)
            .finish_non_exhaustive()
    }
}

impl StateStore for MemoryStateStore {
    fn access(&self) -> Result<Arc<dyn StoreAccessor>, StoreError> {
        Ok(Arc::new(MemoryAccessor {
            inner: Arc::clone(&self.inner),
            open: AtomicBool::new(true),
        }))
    }

    fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }
}

impl StoreInner {
    fn lock_entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rewrite the checkpoint from the given snapshot. Called with the entry
    /// lock held so checkpoints never interleave out of order.
    fn write_checkpoint(&self, entries: &BTreeMap<String, Vec<u8>>) -> Result<(), StoreError> {
        let Some(path) = &self.checkpoint else {
            return Ok(());
        };
        let encoded = serde_json::to_vec_pretty(entries)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &encoded)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

struct MemoryAccessor {
    inner: Arc<StoreInner>,
    open: AtomicBool,
}

impl MemoryAccessor {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }
}

impl StoreAccessor for MemoryAccessor {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_open()?;
        Ok(self.inner.lock_entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut entries = self.inner.lock_entries();
        entries.insert(key.to_owned(), value.to_vec());
        self.inner.write_checkpoint(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut entries = self.inner.lock_entries();
        entries.remove(key);
        self.inner.write_checkpoint(&entries)
    }

    fn each(&self, visit: &mut dyn FnMut(&str, &[u8]) -> bool) -> Result<(), StoreError> {
        self.ensure_open()?;
        let snapshot = self.inner.lock_entries().clone();
        for (key, value) in &snapshot {
            if !visit(key, value) {
                break;
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        if self.open.swap(false, Ordering::AcqRel) {
            let entries = self.inner.lock_entries();
            self.inner.write_checkpoint(&entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove_roundtrip() {
        let store = MemoryStateStore::new();
        let accessor = store.access().unwrap();

        assert!(accessor.get("a").unwrap().is_none());
        accessor.set("a", b"one").unwrap();
        assert_eq!(accessor.get("a").unwrap().as_deref(), Some(&b"one"[..]));

        accessor.remove("a").unwrap();
        assert!(accessor.get("a").unwrap().is_none());
        // Removing an absent key stays quiet.
        accessor.remove("a").unwrap();
    }

    #[test]
    fn test_accessors_share_entries() {
        let store = MemoryStateStore::new();
        let first = store.access().unwrap();
        let second = store.access().unwrap();

        first.set("k", b"v").unwrap();
        assert_eq!(second.get("k").unwrap().as_deref(), Some(&b"v"[..]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_closed_accessor_rejects_operations() {
        let store = MemoryStateStore::new();
        let accessor = store.access().unwrap();
        accessor.set("k", b"v").unwrap();
        accessor.close().unwrap();

        assert!(matches!(accessor.get("k"), Err(StoreError::Closed)));
        assert!(matches!(accessor.set("k", b"x"), Err(StoreError::Closed)));
        // A fresh accessor still works; the store itself stays open.
        let fresh = store.access().unwrap();
        assert_eq!(fresh.get("k").unwrap().as_deref(), Some(&b"v"[..]));
    }

    #[test]
    fn test_each_visits_entries_and_stops_early() {
        let store = MemoryStateStore::new();
        let accessor = store.access().unwrap();
        accessor.set("a", b"1").unwrap();
        accessor.set("b", b"2").unwrap();
        accessor.set("c", b"3").unwrap();

        let mut seen = Vec::new();
        accessor
            .each(&mut |key, _| {
                seen.push(key.to_owned());
                seen.len() < 2
            })
            .unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_checkpoint_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        {
            let store = MemoryStateStore::open(&path).unwrap();
            let accessor = store.access().unwrap();
            accessor.set("filestream-/var/log/a.log", b"{\"offset\":42}").unwrap();
            accessor.close().unwrap();
        }

        let reopened = MemoryStateStore::open(&path).unwrap();
        let accessor = reopened.access().unwrap();
        assert_eq!(
            accessor.get("filestream-/var/log/a.log").unwrap().as_deref(),
            Some(&b"{\"offset\":42}"[..])
        );
    }

    #[test]
    fn test_open_rejects_corrupt_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, b"not json").unwrap();

        assert!(matches!(
            MemoryStateStore::open(&path),
            Err(StoreError::Serde(_))
        ));
    }
}
