//! Cursor state registry over a durable key/value backend.
//!
//! - [`ResourceStore`]: per-namespace registry of lockable cursor entries
//! - [`Resource`]: exclusive cancelable lock, reference count, cursor payload
//! - [`StateStore`] / [`StoreAccessor`]: the injected durable backend boundary
//! - [`MemoryStateStore`]: in-process reference backend with an optional
//!   checkpoint file

mod backend;
mod memory;
mod registry;
mod resource;

pub use backend::{StateStore, StoreAccessor, StoreError};
pub use memory::MemoryStateStore;
pub use registry::ResourceStore;
pub use resource::Resource;

pub(crate) use registry::UpdateOp;
