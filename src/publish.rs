//! Event publishing boundary and acknowledgment-gated cursor commits.
//!
//! The pipeline itself is an external collaborator. This module defines the
//! traits tidemark talks through and the two pieces it owns:
//!
//! - [`CursorPublisher`]: per-source publisher pairing each event with its
//!   staged cursor update
//! - [`CursorAcker`]: acknowledgment listener that commits staged updates in
//!   delivery order, so a crash can never persist a cursor ahead of its data

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::store::{Resource, ResourceStore, UpdateOp};

/// Delivery requirements a client asks of the pipeline.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum PublishMode {
    /// Guarantees are whatever the pipeline is configured to give.
    #[default]
    DefaultGuarantees,
    /// The output decides. The pipeline itself never drops an event; it only
    /// retires events the output has acknowledged, even if the output chose
    /// to drop them.
    OutputChooses,
    /// Events are retried until the output acknowledges them.
    GuaranteedSend,
    /// Events are dropped when the pipeline queue is full, keeping the
    /// producer responsive.
    DropIfFull,
}

/// Errors from the publishing path.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The input's cancellation scope fired while the event was in flight.
    #[error("event publisher has been cancelled")]
    Cancelled,

    /// The sink refused the event because the pipeline is shutting down.
    #[error("event sink is closed")]
    Closed,
}

/// One produced event on its way to the pipeline.
#[derive(Debug)]
pub struct Event {
    /// Production time.
    pub timestamp: DateTime<Utc>,
    /// Event body.
    pub fields: serde_json::Value,
    /// Staged cursor update riding along until acknowledgment.
    op: Option<UpdateOp>,
}

impl Event {
    /// Event with the given body, timestamped now.
    pub fn new(fields: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            fields,
            op: None,
        }
    }

    pub(crate) fn take_op(&mut self) -> Option<UpdateOp> {
        self.op.take()
    }
}

/// Acknowledgment callbacks a client registers with the pipeline.
///
/// The pipeline invokes `on_add` once per event handed to the sink, before
/// delivery; `published` is false when the event was dropped up front and
/// will never be acknowledged. `on_ack` reports acknowledged event counts in
/// delivery order. Callbacks may fire from any task.
pub trait AckListener: Send + Sync {
    /// A new event entered the pipeline.
    fn on_add(&self, event: &mut Event, published: bool);

    /// `count` published events have been acknowledged by the output.
    fn on_ack(&self, count: usize);

    /// The client was closed; no further events will be added.
    fn on_close(&self);
}

/// Connected publishing client.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Hand one event to the pipeline. Depending on the configured
    /// [`PublishMode`] this may wait for queue space or drop the event.
    async fn publish(&self, event: Event) -> Result<(), PublishError>;

    /// Close the client. Events already in the pipeline may still be
    /// acknowledged afterwards.
    async fn close(&self) -> Result<(), PublishError>;
}

/// Event pipeline able to hand out connected clients.
pub trait Pipeline: Send + Sync {
    /// Connect a client with the given settings.
    ///
    /// # Errors
    ///
    /// Returns an error when the pipeline cannot accept new clients.
    fn connect_with(&self, config: SinkConfig) -> Result<Arc<dyn EventSink>, PublishError>;
}

/// Client settings passed to [`Pipeline::connect_with`].
#[derive(Default)]
pub struct SinkConfig {
    /// Delivery requirements for events published through this client.
    pub mode: PublishMode,
    /// Acknowledgment callbacks for the pipeline to invoke.
    pub listener: Option<Arc<dyn AckListener>>,
    /// Token the pipeline may watch to close the client early.
    pub close: Option<CancellationToken>,
}

impl std::fmt::Debug for SinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkConfig")
            .field("mode", &self.mode)
            .field("listener", &self.listener.is_some())
            .finish_non_exhaustive()
    }
}

/// Outbound path handed to a running input.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `event`, optionally staging `cursor` as the source's next
    /// cursor value. A staged value is readable through
    /// [`Cursor`](crate::Cursor) immediately but reaches the durable store
    /// only once the event is acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Cancelled`] when the input's scope fired; the
    /// event itself may still have been accepted by the sink.
    async fn publish(
        &self,
        event: Event,
        cursor: Option<serde_json::Value>,
    ) -> Result<(), PublishError>;
}

/// Per-source publisher pairing events with staged cursor updates.
pub struct CursorPublisher {
    cancel: CancellationToken,
    sink: Arc<dyn EventSink>,
    store: Arc<ResourceStore>,
    resource: Arc<Resource>,
}

impl CursorPublisher {
    pub(crate) fn new(
        cancel: CancellationToken,
        sink: Arc<dyn EventSink>,
        store: Arc<ResourceStore>,
        resource: Arc<Resource>,
    ) -> Self {
        Self {
            cancel,
            sink,
            store,
            resource,
        }
    }

    async fn forward(&self, event: Event) -> Result<(), PublishError> {
        self.sink.publish(event).await?;
        if self.cancel.is_cancelled() {
            return Err(PublishError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Publisher for CursorPublisher {
    async fn publish(
        &self,
        mut event: Event,
        cursor: Option<serde_json::Value>,
    ) -> Result<(), PublishError> {
        if let Some(delta) = cursor {
            event.op = Some(self.store.stage_update(&self.resource, delta));
        }
        self.forward(event).await
    }
}

impl std::fmt::Debug for CursorPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorPublisher")
            .field("key", &self.resource.key())
            .finish_non_exhaustive()
    }
}

/// Commits staged cursor updates as the pipeline acknowledges events.
///
/// In-flight operations are kept in delivery order. An acknowledgment batch
/// executes only the newest operation per resource: operations carry full
/// cursor snapshots, so the last one wins and older ones only release their
/// resource reference.
pub struct CursorAcker {
    inflight: Mutex<VecDeque<Option<UpdateOp>>>,
    closed: AtomicBool,
}

impl CursorAcker {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn lock_inflight(&self) -> MutexGuard<'_, VecDeque<Option<UpdateOp>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CursorAcker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckListener for CursorAcker {
    fn on_add(&self, event: &mut Event, published: bool) {
        let op = event.take_op();
        if !published || self.closed.load(Ordering::Acquire) {
            // Dropping the op discards the staged value and releases the
            // resource reference; the cursor never advances for lost events.
            drop(op);
            return;
        }
        self.lock_inflight().push_back(op);
    }

    fn on_ack(&self, count: usize) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let acked: Vec<UpdateOp> = {
            let mut inflight = self.lock_inflight();
            let take = count.min(inflight.len());
            inflight.drain(..take).flatten().collect()
        };

        let mut newest: HashMap<String, UpdateOp> = HashMap::new();
        for op in acked {
            newest.insert(op.key().to_owned(), op);
        }
        for (_, op) in newest {
            op.execute();
        }
    }

    fn on_close(&self) {
        self.closed.store(true, Ordering::Release);
        let abandoned: Vec<Option<UpdateOp>> = {
            let mut inflight = self.lock_inflight();
            inflight.drain(..).collect()
        };
        drop(abandoned);
    }
}

impl std::fmt::Debug for CursorAcker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorAcker")
            .field("inflight", &self.lock_inflight().len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}
