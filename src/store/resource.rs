//! Per-key registry entry: exclusive lock, reference count, cursor state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Mutable cursor state, guarded by the resource's state mutex.
#[derive(Debug)]
pub(crate) struct CursorState {
    /// Idle time before the entry may be evicted.
    pub(crate) ttl: Duration,
    /// Last activity: creation, lock release, ttl refresh, or cursor commit.
    pub(crate) updated: DateTime<Utc>,
    /// Committed cursor, mirrored to the durable store.
    pub(crate) cursor: Option<serde_json::Value>,
    /// Staged cursor awaiting acknowledgment.
    pub(crate) pending: Option<serde_json::Value>,
    /// Update operations currently in flight.
    pub(crate) active_ops: usize,
    /// The entry exists in the durable store.
    pub(crate) stored: bool,
    /// The committed state is durable. Unsynced entries are never evicted.
    pub(crate) synced: bool,
}

/// One lockable, reference-counted cursor entry.
///
/// The lock is a single-permit semaphore: [`try_lock`](Resource::try_lock)
/// and [`lock_with_cancellation`](Resource::lock_with_cancellation) consume
/// the permit, [`unlock`](Resource::unlock) restores it. The reference count
/// tracks outstanding holders (input tasks and in-flight cursor updates); a
/// final release only makes the entry a candidate for the next sweep, it
/// never deletes anything itself.
pub struct Resource {
    key: String,
    lock: Semaphore,
    refcount: AtomicUsize,
    state: Mutex<CursorState>,
}

impl Resource {
    /// Fresh entry for a key never seen in the durable store.
    pub(crate) fn new(key: String, ttl: Duration) -> Self {
        Self {
            key,
            lock: Semaphore::new(1),
            refcount: AtomicUsize::new(0),
            state: Mutex::new(CursorState {
                ttl,
                updated: Utc::now(),
                cursor: None,
                pending: None,
                active_ops: 0,
                stored: false,
                synced: true,
            }),
        }
    }

    /// Entry rebuilt from a persisted envelope at store open.
    pub(crate) fn from_envelope(
        key: String,
        ttl: Duration,
        updated: DateTime<Utc>,
        cursor: Option<serde_json::Value>,
    ) -> Self {
        Self {
            key,
            lock: Semaphore::new(1),
            refcount: AtomicUsize::new(0),
            state: Mutex::new(CursorState {
                ttl,
                updated,
                cursor,
                pending: None,
                active_ops: 0,
                stored: true,
                synced: true,
            }),
        }
    }

    /// The persisted store key this entry belongs to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Non-blocking acquire. Returns false when another holder has the lock.
    pub(crate) fn try_lock(&self) -> bool {
        match self.lock.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Blocking acquire, bounded by `cancel`.
    ///
    /// Returns true once the lock is held. Returns false when the token fired
    /// first; the abandoned wait leaves no claim on the lock, so a later
    /// holder is unaffected. The token is checked before the permit, so no
    /// acquisition is granted once cancellation has fired.
    pub(crate) async fn lock_with_cancellation(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            permit = self.lock.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    true
                }
                Err(_) => false,
            },
        }
    }

    /// Release the exclusive lock and mark the activity timestamp.
    pub(crate) fn unlock(&self) {
        {
            let mut state = self.lock_state();
            state.updated = Utc::now();
        }
        self.lock.add_permits(1);
    }

    /// True while some holder has the exclusive lock.
    pub(crate) fn is_locked(&self) -> bool {
        self.lock.available_permits() == 0
    }

    pub(crate) fn retain(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        let previous = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "resource released more often than retained");
    }

    /// Outstanding holder count.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// True until a cursor value has been staged or committed.
    pub fn is_new(&self) -> bool {
        let state = self.lock_state();
        state.pending.is_none() && state.cursor.is_none()
    }

    /// Cursor value as seen by readers: staged first, committed second.
    pub(crate) fn cursor_value(&self) -> Option<serde_json::Value> {
        let state = self.lock_state();
        state.pending.clone().or_else(|| state.cursor.clone())
    }

    /// Eviction condition checked by the sweep: unreferenced, unlocked,
    /// durable, and idle at least its ttl.
    pub(crate) fn is_evictable(&self, now: DateTime<Utc>) -> bool {
        if self.refcount() > 0 || self.is_locked() {
            return false;
        }
        let state = self.lock_state();
        if !state.synced {
            return false;
        }
        match (now - state.updated).to_std() {
            Ok(idle) => idle >= state.ttl,
            Err(_) => false,
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, CursorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("key", &self.key)
            .field("refcount", &self.refcount())
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}
