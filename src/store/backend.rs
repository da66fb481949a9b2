//! Trait boundary to the durable key/value backend.
//!
//! The registry does not persist anything itself. It is handed a
//! [`StateStore`] at construction and talks to the backend through the
//! [`StoreAccessor`] handle it returns. Any backend with crash-consistent
//! per-write durability can sit behind these traits; the crate ships
//! [`MemoryStateStore`](crate::store::MemoryStateStore) as the in-process
//! reference implementation.

use std::sync::Arc;
use std::time::Duration;

/// Errors surfaced by a durable store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying I/O failure while reading or writing an entry.
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An entry payload could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The accessor was used after `close`.
    #[error("store accessor is closed")]
    Closed,

    /// Backend-specific failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Provider of durable store handles.
///
/// One `StateStore` is injected per [`InputManager`](crate::InputManager).
/// `access` is called once, during manager initialization; the returned
/// accessor is shared by the registry, the cleanup task, and every running
/// input until the last of them releases the store.
pub trait StateStore: Send + Sync + 'static {
    /// Open a handle to the durable backend.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend cannot be opened. The manager caches
    /// the failure and reports it to every subsequent caller.
    fn access(&self) -> Result<Arc<dyn StoreAccessor>, StoreError>;

    /// Preferred sweep interval for the cleanup task.
    ///
    /// A zero interval means the backend has no preference and the manager's
    /// default applies.
    fn cleanup_interval(&self) -> Duration;
}

/// Open handle to the durable backend.
///
/// Values are opaque byte payloads. Every `set` and `remove` must be durable
/// before it returns; a crash after either call must not roll it back.
/// Implementations are shared across tasks and must be internally
/// synchronized.
pub trait StoreAccessor: Send + Sync + 'static {
    /// Read the payload stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Durably write `value` under `key`, replacing any existing payload.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Durably remove `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Visit every stored entry. Iteration stops early when `visit` returns
    /// false.
    fn each(&self, visit: &mut dyn FnMut(&str, &[u8]) -> bool) -> Result<(), StoreError>;

    /// Flush outstanding writes and close the handle. Later operations on the
    /// handle fail with [`StoreError::Closed`].
    fn close(&self) -> Result<(), StoreError>;
}
