//! The contract an input type implements to be managed.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cursor::Cursor;
use crate::manager::InputError;
use crate::publish::Publisher;

/// One named unit of work an input collects from.
pub trait Source: Send + Sync {
    /// Stable identifier of this source, unique within its input type. It is
    /// the last segment of the durable key its cursor is stored under, so
    /// renaming a source orphans its previous state.
    fn name(&self) -> &str;
}

/// Runtime scope handed to a running input.
#[derive(Debug, Clone)]
pub struct InputContext {
    /// Identifier of this run, refined per source worker.
    pub id: String,
    /// Fires when this scope must stop.
    pub cancel: CancellationToken,
}

/// The runner behind every source of one input type.
#[async_trait]
pub trait Input: Send + Sync {
    /// Name of the input type, used in identifiers and logs.
    fn name(&self) -> &str;

    /// Collect from `source` until done or cancelled.
    ///
    /// The source's resource stays exclusively locked for the whole call.
    /// `cursor` reads the most recent state, staged updates included, and
    /// `publisher` pairs produced events with cursor updates that become
    /// durable once the pipeline acknowledges the event.
    async fn run(
        &self,
        ctx: &InputContext,
        source: &dyn Source,
        cursor: Cursor,
        publisher: &dyn Publisher,
    ) -> Result<(), InputError>;

    /// Cheap configuration check for `source`. No resource is locked and no
    /// state is touched.
    async fn test(&self, _ctx: &InputContext, _source: &dyn Source) -> Result<(), InputError> {
        Ok(())
    }
}
