//! Input lifecycle coordination on top of the cursor state registry.
//!
//! [`InputManager`] is created once per input type. It opens the registry on
//! first use, starts the background [`Cleaner`](crate::cleaner::Cleaner) when
//! the host runs in [`RunMode::Run`], and turns raw input configurations into
//! [`ManagedInput`] values ready to run.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cleaner::Cleaner;
use crate::config::{ConfigError, InputSettings, DEFAULT_CLEANUP_INTERVAL, DEFAULT_CLEAN_TIMEOUT};
use crate::input::{Input, ManagedInput, Source};
use crate::publish::PublishError;
use crate::store::{Resource, ResourceStore, StateStore, StoreError};

/// How the host process was asked to run its inputs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RunMode {
    /// Normal collection; background maintenance runs.
    Run,
    /// Configuration test; nothing is started.
    Test,
    /// Any other management mode; nothing is started.
    Other,
}

/// Errors from input creation and execution.
#[derive(Debug, Error)]
pub enum InputError {
    /// The configuration produced no sources to collect from.
    #[error("no source has been configured")]
    NoSourceConfigured,

    /// The configuration produced no runner for its sources.
    #[error("no input runner available")]
    NoInputRunner,

    /// The input settings could not be parsed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Opening the cursor state registry failed. The same error is returned
    /// on every retry; initialization runs once per manager.
    #[error("store initialization failed")]
    Init(#[source] Arc<StoreError>),

    /// The background cleaner could not be spawned.
    #[error("can not start registry cleanup process")]
    CleanerStart(#[source] tokio::runtime::TryCurrentError),

    /// A durable store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The event pipeline rejected an operation.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// The input's cancellation scope fired.
    #[error("input has been cancelled")]
    Cancelled,

    /// The input runner itself failed.
    #[error("input failed: {0}")]
    Run(String),
}

/// Parses one input configuration into its sources and runner.
///
/// Returning an empty source list or no runner makes
/// [`InputManager::create_input`] fail with [`InputError::NoSourceConfigured`]
/// or [`InputError::NoInputRunner`].
pub type Configure = dyn Fn(&serde_json::Value) -> Result<(Vec<Arc<dyn Source>>, Option<Arc<dyn Input>>), InputError>
    + Send
    + Sync;

/// Shared lifecycle layer for all inputs of one type.
pub struct InputManager {
    namespace: String,
    state_store: Arc<dyn StateStore>,
    default_clean_timeout: Duration,
    configure: Box<Configure>,
    init: OnceLock<Result<Arc<ResourceStore>, Arc<StoreError>>>,
}

impl InputManager {
    /// Manager for inputs whose durable keys share `namespace`.
    pub fn new(
        namespace: impl Into<String>,
        state_store: Arc<dyn StateStore>,
        configure: impl Fn(
                &serde_json::Value,
            ) -> Result<(Vec<Arc<dyn Source>>, Option<Arc<dyn Input>>), InputError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            state_store,
            default_clean_timeout: DEFAULT_CLEAN_TIMEOUT,
            configure: Box::new(configure),
            init: OnceLock::new(),
        }
    }

    /// Resource ttl applied when an input configuration does not set one.
    /// Zero falls back to the built-in default.
    pub fn with_default_clean_timeout(mut self, timeout: Duration) -> Self {
        self.default_clean_timeout = if timeout.is_zero() {
            DEFAULT_CLEAN_TIMEOUT
        } else {
            timeout
        };
        self
    }

    /// Open the cursor state registry.
    ///
    /// The first call decides the outcome; every later call, from any task,
    /// returns that same outcome without touching the backend again.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::Init`] when the first open failed.
    pub fn initialize(&self) -> Result<(), InputError> {
        self.store().map(|_| ())
    }

    pub(crate) fn store(&self) -> Result<Arc<ResourceStore>, InputError> {
        let outcome = self.init.get_or_init(|| {
            let accessor = self.state_store.access().map_err(Arc::new)?;
            ResourceStore::open(accessor, &self.namespace, self.default_clean_timeout)
                .map_err(Arc::new)
        });
        match outcome {
            Ok(store) => Ok(Arc::clone(store)),
            Err(e) => Err(InputError::Init(Arc::clone(e))),
        }
    }

    /// Start background maintenance for the lifetime of `cancel`.
    ///
    /// Only [`RunMode::Run`] starts anything; the other modes return without
    /// touching the store. The registry stays retained until `cancel` fires
    /// and the cleaner has exited, so entries written by still-draining
    /// inputs reach the backend.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::CleanerStart`] when no runtime is available to
    /// spawn the cleaner; the registry reference is given back before the
    /// error surfaces.
    pub fn start(&self, mode: RunMode, cancel: &CancellationToken) -> Result<(), InputError> {
        if mode != RunMode::Run {
            return Ok(());
        }

        let store = self.store()?;
        let mut interval = self.state_store.cleanup_interval();
        if interval.is_zero() {
            interval = DEFAULT_CLEANUP_INTERVAL;
        }

        store.retain();
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                // Give back the cleaner's reference and the creation
                // reference; the manager is unusable for collection now.
                store.release();
                store.release();
                return Err(InputError::CleanerStart(e));
            }
        };

        let cancel = cancel.clone();
        handle.spawn(async move {
            Cleaner::new(Arc::clone(&store), interval).run(cancel).await;
            store.release();
            store.release();
        });
        Ok(())
    }

    /// Build a managed input from its configuration.
    ///
    /// # Errors
    ///
    /// Fails when the registry cannot be opened, the settings do not parse,
    /// the configure callback fails, no source was configured, or no runner
    /// is available. A failed creation leaves no trace in the store.
    pub fn create_input(
        self: &Arc<Self>,
        config: &serde_json::Value,
    ) -> Result<ManagedInput, InputError> {
        self.initialize()?;
        let settings = InputSettings::from_config(config, self.default_clean_timeout)?;
        let (sources, input) = (self.configure)(config)?;
        if sources.is_empty() {
            return Err(InputError::NoSourceConfigured);
        }
        let input = input.ok_or(InputError::NoInputRunner)?;
        Ok(ManagedInput::new(Arc::clone(self), settings, sources, input))
    }

    pub(crate) fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Lock `key` for exclusive use, waiting until the holder lets go or
    /// `cancel` fires. The guard unlocks and releases exactly once on drop.
    pub(crate) async fn lock(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<ResourceGuard, InputError> {
        let store = self.store()?;
        let resource = store.get(key);
        if !resource.try_lock() {
            tracing::info!(key = %resource.key(), "Resource currently in use, waiting...");
            if !resource.lock_with_cancellation(cancel).await {
                tracing::debug!(key = %resource.key(), "Input for resource has been stopped while waiting");
                resource.release();
                return Err(InputError::Cancelled);
            }
        }
        Ok(ResourceGuard::new(resource))
    }
}

impl std::fmt::Debug for InputManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputManager")
            .field("namespace", &self.namespace)
            .field("default_clean_timeout", &self.default_clean_timeout)
            .field("initialized", &self.init.get().is_some())
            .finish_non_exhaustive()
    }
}

/// Exclusively locked, retained resource.
///
/// Dropping the guard unlocks the resource and releases the reference taken
/// when it was looked up, in that order.
pub struct ResourceGuard {
    resource: Arc<Resource>,
}

impl ResourceGuard {
    fn new(resource: Arc<Resource>) -> Self {
        Self { resource }
    }

    /// The locked resource.
    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.resource.unlock();
        self.resource.release();
    }
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("key", &self.resource.key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStateStore, StoreAccessor};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingStore {
        inner: MemoryStateStore,
        accesses: AtomicUsize,
        fail: bool,
    }

    impl CountingStore {
        fn new(fail: bool) -> Self {
            Self {
                inner: MemoryStateStore::new(),
                accesses: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl StateStore for CountingStore {
        fn access(&self) -> Result<Arc<dyn StoreAccessor>, StoreError> {
            self.accesses.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StoreError::Backend("backend unavailable".to_owned()));
            }
            self.inner.access()
        }

        fn cleanup_interval(&self) -> Duration {
            Duration::from_millis(10)
        }
    }

    /// Keeps a handle on the accessor the manager opened, so tests can
    /// observe it being closed on the last release.
    #[derive(Default)]
    struct CapturingStore {
        inner: MemoryStateStore,
        last: Mutex<Option<Arc<dyn StoreAccessor>>>,
    }

    impl StateStore for CapturingStore {
        fn access(&self) -> Result<Arc<dyn StoreAccessor>, StoreError> {
            let accessor = self.inner.access()?;
            *self.last.lock().unwrap() = Some(Arc::clone(&accessor));
            Ok(accessor)
        }

        fn cleanup_interval(&self) -> Duration {
            Duration::from_millis(10)
        }
    }

    struct NamedSource(String);

    impl crate::input::Source for NamedSource {
        fn name(&self) -> &str {
            &self.0
        }
    }

    fn manager_over(state_store: Arc<dyn StateStore>) -> Arc<InputManager> {
        Arc::new(InputManager::new("test", state_store, |_| {
            Ok((Vec::new(), None))
        }))
    }

    #[test]
    fn test_initialization_runs_once_across_threads() {
        let backend = Arc::new(CountingStore::new(false));
        let manager = manager_over(Arc::clone(&backend) as Arc<dyn StateStore>);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| manager.initialize().unwrap());
            }
        });

        assert_eq!(backend.accesses.load(Ordering::SeqCst), 1);
        let a = manager.store().unwrap();
        let b = manager.store().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_failed_initialization_is_cached() {
        let backend = Arc::new(CountingStore::new(true));
        let manager = manager_over(Arc::clone(&backend) as Arc<dyn StateStore>);

        assert!(matches!(manager.initialize(), Err(InputError::Init(_))));
        assert!(matches!(manager.initialize(), Err(InputError::Init(_))));
        assert_eq!(backend.accesses.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_creation_requires_sources_and_runner() {
        let manager = manager_over(Arc::new(MemoryStateStore::new()));
        let err = manager.create_input(&json!({})).unwrap_err();
        assert!(matches!(err, InputError::NoSourceConfigured));

        let manager = Arc::new(InputManager::new(
            "test",
            Arc::new(MemoryStateStore::new()) as Arc<dyn StateStore>,
            |_| {
                let source = Arc::new(NamedSource("a".to_owned())) as Arc<dyn Source>;
                Ok((vec![source], None))
            },
        ));
        let err = manager.create_input(&json!({})).unwrap_err();
        assert!(matches!(err, InputError::NoInputRunner));
    }

    #[test]
    fn test_creation_failure_leaves_store_empty() {
        let manager = manager_over(Arc::new(MemoryStateStore::new()));
        manager.create_input(&json!({})).unwrap_err();
        assert_eq!(manager.store().unwrap().len(), 0);
    }

    #[test]
    fn test_bad_settings_are_rejected_before_configure() {
        let called = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&called);
        let manager = Arc::new(InputManager::new(
            "test",
            Arc::new(MemoryStateStore::new()) as Arc<dyn StateStore>,
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok((Vec::new(), None))
            },
        ));

        let err = manager
            .create_input(&json!({"clean_timeout": "soon"}))
            .unwrap_err();
        assert!(matches!(err, InputError::Config(_)));
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_outside_run_mode_is_a_no_op() {
        let backend = Arc::new(CountingStore::new(false));
        let manager = manager_over(Arc::clone(&backend) as Arc<dyn StateStore>);
        let cancel = CancellationToken::new();

        manager.start(RunMode::Test, &cancel).unwrap();
        manager.start(RunMode::Other, &cancel).unwrap();
        assert_eq!(backend.accesses.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_without_runtime_releases_the_store() {
        let backend = Arc::new(CapturingStore::default());
        let manager = manager_over(Arc::clone(&backend) as Arc<dyn StateStore>);
        let cancel = CancellationToken::new();

        let err = manager.start(RunMode::Run, &cancel).unwrap_err();
        assert!(matches!(err, InputError::CleanerStart(_)));

        // Both references were given back, closing the accessor.
        let accessor = backend.last.lock().unwrap().clone().unwrap();
        assert!(matches!(accessor.get("any"), Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn test_start_runs_the_cleaner_until_cancelled() {
        let backend = Arc::new(CapturingStore::default());
        let manager = Arc::new(
            InputManager::new(
                "test",
                Arc::clone(&backend) as Arc<dyn StateStore>,
                |_| Ok((Vec::new(), None)),
            )
            .with_default_clean_timeout(Duration::from_millis(5)),
        );
        let cancel = CancellationToken::new();

        // An unlocked, unreferenced entry that is already idle.
        let store = manager.store().unwrap();
        let guard = manager.lock(&cancel, "test-old").await.unwrap();
        drop(guard);
        assert_eq!(store.len(), 1);

        manager.start(RunMode::Run, &cancel).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.len(), 0);

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let accessor = backend.last.lock().unwrap().clone().unwrap();
        assert!(matches!(accessor.get("any"), Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn test_lock_waits_for_the_holder() {
        let manager = manager_over(Arc::new(MemoryStateStore::new()));
        let cancel = CancellationToken::new();

        let guard = manager.lock(&cancel, "test-shared").await.unwrap();
        let contender = {
            let manager = Arc::clone(&manager);
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.lock(&cancel, "test-shared").await.map(drop) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_waiter_gives_back_its_reference() {
        let manager = manager_over(Arc::new(MemoryStateStore::new()));
        let cancel = CancellationToken::new();

        let guard = manager.lock(&cancel, "test-shared").await.unwrap();
        let waiter_cancel = CancellationToken::new();
        let contender = {
            let manager = Arc::clone(&manager);
            let waiter_cancel = waiter_cancel.clone();
            tokio::spawn(async move { manager.lock(&waiter_cancel, "test-shared").await.map(drop) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter_cancel.cancel();
        let result = contender.await.unwrap();
        assert!(matches!(result, Err(InputError::Cancelled)));

        // Only the guard still holds a reference, and the lock is intact.
        assert_eq!(guard.resource().refcount(), 1);
        drop(guard);

        let again = manager.lock(&cancel, "test-shared").await.unwrap();
        assert_eq!(again.resource().refcount(), 1);
    }

    #[test]
    fn test_run_mode_string_forms() {
        assert_eq!(RunMode::Run.to_string(), "run");
        assert_eq!("test".parse::<RunMode>().unwrap(), RunMode::Test);
    }
}
