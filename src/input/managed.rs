//! Execution of one configured input across its sources.

use std::sync::Arc;

use tokio::task::JoinSet;

use crate::config::InputSettings;
use crate::cursor::Cursor;
use crate::manager::{InputError, InputManager};
use crate::publish::{AckListener, CursorAcker, CursorPublisher, Pipeline, PublishMode, SinkConfig};
use crate::store::ResourceStore;

use super::{Input, InputContext, Source};

/// Durable key for `source_name` within `namespace`.
///
/// The id segment appears only when a non-empty id was configured. The
/// resulting string is the persisted store key: changing the id, or setting
/// one where none was set, moves the source to a different cursor entry.
pub fn source_key(namespace: &str, input_id: &str, source_name: &str) -> String {
    if input_id.is_empty() {
        format!("{namespace}-{source_name}")
    } else {
        format!("{namespace}-[{input_id}]-{source_name}")
    }
}

/// One configured input bound to its sources, ready to run.
pub struct ManagedInput {
    manager: Arc<InputManager>,
    settings: InputSettings,
    sources: Vec<Arc<dyn Source>>,
    input: Arc<dyn Input>,
}

impl ManagedInput {
    pub(crate) fn new(
        manager: Arc<InputManager>,
        settings: InputSettings,
        sources: Vec<Arc<dyn Source>>,
        input: Arc<dyn Input>,
    ) -> Self {
        Self {
            manager,
            settings,
            sources,
            input,
        }
    }

    /// Name of the underlying input type.
    pub fn name(&self) -> &str {
        self.input.name()
    }

    /// Check every source's configuration concurrently; nothing is locked.
    ///
    /// # Errors
    ///
    /// Returns the first failure after all checks have finished; the others
    /// are logged.
    pub async fn test(&self, ctx: &InputContext) -> Result<(), InputError> {
        let mut checks = JoinSet::new();
        for source in &self.sources {
            let input = Arc::clone(&self.input);
            let source = Arc::clone(source);
            let ctx = ctx.clone();
            checks.spawn(async move {
                let name = source.name().to_owned();
                (name, input.test(&ctx, source.as_ref()).await)
            });
        }
        self.collect_errors(checks, "Source failed the configuration test")
            .await
    }

    /// Run the input over all of its sources until every worker finishes or
    /// `ctx` is cancelled.
    ///
    /// Each source gets its own task and its own child cancellation scope.
    /// A worker failing, or giving up its lock wait, never affects its
    /// siblings; the first real failure is returned once all workers are
    /// done. Lock-wait cancellation is a clean exit, not a failure.
    pub async fn run(
        &self,
        ctx: &InputContext,
        pipeline: Arc<dyn Pipeline>,
    ) -> Result<(), InputError> {
        let _store = RetainedStore::new(self.manager.store()?);

        let mut workers = JoinSet::new();
        for source in &self.sources {
            let manager = Arc::clone(&self.manager);
            let input = Arc::clone(&self.input);
            let source = Arc::clone(source);
            let settings = self.settings.clone();
            let pipeline = Arc::clone(&pipeline);
            let worker_ctx = InputContext {
                id: format!("{}::{}", ctx.id, source.name()),
                cancel: ctx.cancel.child_token(),
            };
            workers.spawn(async move {
                let name = source.name().to_owned();
                let result =
                    run_source(manager, input, source, settings, worker_ctx, pipeline).await;
                (name, result)
            });
        }

        self.collect_errors(workers, "Source collection failed").await
    }

    async fn collect_errors(
        &self,
        mut tasks: JoinSet<(String, Result<(), InputError>)>,
        failure: &'static str,
    ) -> Result<(), InputError> {
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(InputError::Cancelled))) => {
                    tracing::debug!(input = %self.input.name(), source = %name, "Source stopped on cancellation");
                }
                Ok((name, Err(e))) => {
                    tracing::error!(input = %self.input.name(), source = %name, error = %e, "{failure}");
                    first_error.get_or_insert(e);
                }
                Err(e) if e.is_panic() => {
                    tracing::error!(input = %self.input.name(), error = %e, "Source task panicked");
                    first_error
                        .get_or_insert_with(|| InputError::Run(format!("source task panicked: {e}")));
                }
                Err(e) => {
                    tracing::error!(input = %self.input.name(), error = %e, "Source task did not complete");
                    first_error.get_or_insert_with(|| InputError::Run(e.to_string()));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ManagedInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedInput")
            .field("input", &self.input.name())
            .field("sources", &self.sources.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Store reference held for the duration of a run, given back even when the
/// run future is dropped mid-flight.
struct RetainedStore(Arc<ResourceStore>);

impl RetainedStore {
    fn new(store: Arc<ResourceStore>) -> Self {
        store.retain();
        Self(store)
    }
}

impl Drop for RetainedStore {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// One source worker: connect a sink, take the lock, run the input, then
/// unlock and close in that order.
async fn run_source(
    manager: Arc<InputManager>,
    input: Arc<dyn Input>,
    source: Arc<dyn Source>,
    settings: InputSettings,
    ctx: InputContext,
    pipeline: Arc<dyn Pipeline>,
) -> Result<(), InputError> {
    let sink = pipeline.connect_with(SinkConfig {
        mode: PublishMode::default(),
        listener: Some(Arc::new(CursorAcker::new()) as Arc<dyn AckListener>),
        close: Some(ctx.cancel.clone()),
    })?;

    let result = async {
        let store = manager.store()?;
        let key = source_key(manager.namespace(), &settings.id, source.name());
        let guard = manager.lock(&ctx.cancel, &key).await?;
        store.update_ttl(guard.resource(), settings.clean_timeout);

        let cursor = Cursor::new(Arc::clone(guard.resource()));
        let publisher = CursorPublisher::new(
            ctx.cancel.clone(),
            Arc::clone(&sink),
            store,
            Arc::clone(guard.resource()),
        );
        let run = input.run(&ctx, source.as_ref(), cursor, &publisher).await;
        drop(guard);
        run
    }
    .await;

    if let Err(e) = sink.close().await {
        tracing::debug!(error = %e, "Closing the event sink failed");
    }
    result
}
