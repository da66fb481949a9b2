//! Key to resource registry over the durable accessor.
//!
//! One [`ResourceStore`] exists per input-type namespace. It owns the durable
//! accessor handle, preloads every persisted entry under its namespace prefix
//! at open, hands out reference-counted [`Resource`]s, and mirrors cursor
//! state back to the backend as a JSON envelope. The store itself is
//! retain/release-counted so the accessor closes only after the manager, the
//! cleanup task, and every running input have let go.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::backend::{StoreAccessor, StoreError};
use super::resource::{CursorState, Resource};

/// Persisted per-key payload: `{"ttl": "30m", "updated": <rfc3339>, "cursor": ...}`.
#[derive(Debug, Serialize, Deserialize)]
struct StateEnvelope {
    #[serde(with = "humantime_serde")]
    ttl: Duration,
    updated: DateTime<Utc>,
    cursor: Option<serde_json::Value>,
}

/// Counts from one sweep pass.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SweepStats {
    pub(crate) removed: usize,
    pub(crate) failed: usize,
}

struct Inner {
    /// Store-level holders: the open reference, the cleanup task, running inputs.
    refcount: usize,
    /// Dropped when the refcount returns to zero; `None` afterwards.
    accessor: Option<Arc<dyn StoreAccessor>>,
    table: HashMap<String, Arc<Resource>>,
}

/// Process-scoped registry mapping store keys to resources.
pub struct ResourceStore {
    namespace: String,
    default_ttl: Duration,
    inner: Mutex<Inner>,
}

impl ResourceStore {
    /// Open the registry over an accessor, preloading all entries whose key
    /// starts with `"<namespace>-"`. Entries that fail to decode are logged
    /// and left untouched in the backend.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend iteration itself fails.
    pub(crate) fn open(
        accessor: Arc<dyn StoreAccessor>,
        namespace: &str,
        default_ttl: Duration,
    ) -> Result<Arc<Self>, StoreError> {
        let prefix = format!("{namespace}-");
        let mut table = HashMap::new();

        accessor.each(&mut |key, value| {
            if !key.starts_with(&prefix) {
                return true;
            }
            match serde_json::from_slice::<StateEnvelope>(value) {
                Ok(envelope) => {
                    let resource = Resource::from_envelope(
                        key.to_owned(),
                        envelope.ttl,
                        envelope.updated,
                        envelope.cursor,
                    );
                    table.insert(key.to_owned(), Arc::new(resource));
                }
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "Failed to decode persisted cursor state, entry ignored");
                }
            }
            true
        })?;

        tracing::debug!(namespace = %namespace, entries = table.len(), "Opened cursor state registry");

        Ok(Arc::new(Self {
            namespace: namespace.to_owned(),
            default_ttl,
            inner: Mutex::new(Inner {
                refcount: 1,
                accessor: Some(accessor),
                table,
            }),
        }))
    }

    /// Resource for `key`, created on first access.
    ///
    /// Every call increments the resource's reference count; the caller owes
    /// exactly one matching release, which the lock guard and the update
    /// operations perform on drop.
    pub fn get(&self, key: &str) -> Arc<Resource> {
        let mut inner = self.lock_inner();
        let resource = inner
            .table
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Resource::new(key.to_owned(), self.default_ttl)))
            .clone();
        resource.retain();
        resource
    }

    /// Count the store handle for another holder.
    pub(crate) fn retain(&self) {
        let mut inner = self.lock_inner();
        inner.refcount += 1;
    }

    /// Drop one store holder; the last one out closes the accessor.
    pub(crate) fn release(&self) {
        let closing = {
            let mut inner = self.lock_inner();
            inner.refcount = inner.refcount.saturating_sub(1);
            if inner.refcount == 0 {
                inner.accessor.take()
            } else {
                None
            }
        };
        if let Some(accessor) = closing {
            if let Err(e) = accessor.close() {
                tracing::error!(namespace = %self.namespace, error = %e, "Failed to close state store accessor");
            }
        }
    }

    /// Apply an input's configured clean timeout to an entry.
    ///
    /// Writes through to the backend only when the entry is already stored,
    /// so sources that never produce a cursor never create durable entries.
    pub(crate) fn update_ttl(&self, resource: &Resource, ttl: Duration) {
        let accessor = self.accessor();
        let mut state = resource.lock_state();
        if state.ttl == ttl {
            return;
        }
        state.ttl = ttl;
        state.updated = Utc::now();
        if !state.stored {
            return;
        }
        match accessor {
            Some(accessor) => persist_envelope(accessor.as_ref(), resource.key(), &mut state),
            None => state.synced = false,
        }
    }

    /// Stage a cursor update for `resource`.
    ///
    /// The staged value is readable immediately; it reaches the backend only
    /// when the returned operation executes. The operation holds one resource
    /// reference until it is executed or dropped.
    pub(crate) fn stage_update(
        self: &Arc<Self>,
        resource: &Arc<Resource>,
        delta: serde_json::Value,
    ) -> UpdateOp {
        let timestamp = Utc::now();
        {
            let mut state = resource.lock_state();
            state.active_ops += 1;
            state.pending = Some(delta.clone());
        }
        resource.retain();
        UpdateOp {
            store: Arc::clone(self),
            resource: Arc::clone(resource),
            timestamp,
            delta,
            done: false,
        }
    }

    /// One sweep pass: evict every entry that is unreferenced, unlocked,
    /// synced, and idle past its ttl. The durable entry is removed first; a
    /// backend failure keeps the entry for the next pass.
    pub(crate) fn remove_idle(&self, now: DateTime<Utc>) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut inner = self.lock_inner();
        let Some(accessor) = inner.accessor.clone() else {
            return stats;
        };

        let eligible: Vec<String> = inner
            .table
            .iter()
            .filter(|(_, resource)| resource.is_evictable(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in eligible {
            match accessor.remove(&key) {
                Ok(()) => {
                    inner.table.remove(&key);
                    stats.removed += 1;
                }
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "Failed to remove stale cursor entry, keeping it for the next sweep");
                    stats.failed += 1;
                }
            }
        }
        stats
    }

    /// Number of resources currently registered.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock_inner().table.len()
    }

    fn commit_update(&self, resource: &Resource, timestamp: DateTime<Utc>, delta: &serde_json::Value) {
        let accessor = self.accessor();
        let mut state = resource.lock_state();
        state.active_ops = state.active_ops.saturating_sub(1);
        state.cursor = Some(delta.clone());
        if state.updated < timestamp {
            state.updated = timestamp;
        }
        if state.active_ops == 0 {
            state.pending = None;
        }
        match accessor {
            Some(accessor) => persist_envelope(accessor.as_ref(), resource.key(), &mut state),
            None => {
                state.synced = false;
                tracing::error!(key = %resource.key(), "Cursor commit against a released store, update kept in memory only");
            }
        }
    }

    fn discard_update(&self, resource: &Resource) {
        let mut state = resource.lock_state();
        state.active_ops = state.active_ops.saturating_sub(1);
        if state.active_ops == 0 {
            state.pending = None;
        }
    }

    fn accessor(&self) -> Option<Arc<dyn StoreAccessor>> {
        self.lock_inner().accessor.clone()
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock_inner();
        f.debug_struct("ResourceStore")
            .field("namespace", &self.namespace)
            .field("resources", &inner.table.len())
            .field("refcount", &inner.refcount)
            .finish_non_exhaustive()
    }
}

/// Serialize the envelope for `key` and write it through.
///
/// Called with the resource's state mutex held; flags the state unsynced when
/// the write fails so the sweep keeps the entry.
fn persist_envelope(accessor: &dyn StoreAccessor, key: &str, state: &mut CursorState) {
    let envelope = StateEnvelope {
        ttl: state.ttl,
        updated: state.updated,
        cursor: state.cursor.clone(),
    };
    let encoded = match serde_json::to_vec(&envelope) {
        Ok(encoded) => encoded,
        Err(e) => {
            tracing::error!(key = %key, error = %e, "Failed to encode cursor state");
            state.synced = false;
            return;
        }
    };
    match accessor.set(key, &encoded) {
        Ok(()) => {
            state.stored = true;
            state.synced = true;
        }
        Err(e) => {
            tracing::error!(key = %key, error = %e, "Failed to persist cursor state");
            state.synced = false;
        }
    }
}

/// Staged cursor update, committed on acknowledgment.
///
/// Created by [`ResourceStore::stage_update`]; rides along with the published
/// event until the acknowledgment path executes it. Dropping an un-executed
/// operation discards the staged value and releases the resource reference.
pub(crate) struct UpdateOp {
    store: Arc<ResourceStore>,
    resource: Arc<Resource>,
    timestamp: DateTime<Utc>,
    delta: serde_json::Value,
    done: bool,
}

impl UpdateOp {
    /// Commit the staged value durably and mark the entry's activity.
    pub(crate) fn execute(mut self) {
        self.done = true;
        self.store
            .commit_update(&self.resource, self.timestamp, &self.delta);
    }

    /// Key of the resource this operation belongs to.
    pub(crate) fn key(&self) -> &str {
        self.resource.key()
    }
}

impl Drop for UpdateOp {
    fn drop(&mut self) {
        if !self.done {
            self.store.discard_update(&self.resource);
        }
        self.resource.release();
    }
}

impl std::fmt::Debug for UpdateOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateOp")
            .field("key", &self.resource.key())
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}
