//! Resource-locking and lifecycle layer for concurrent, restartable
//! collection from named sources.
//!
//! For any source key, at most one collector holds and mutates its cursor
//! state at a time, even across independently configured inputs. Cursors
//! survive restarts through a pluggable durable store, and a background
//! cleaner evicts entries nobody has touched for their configured timeout.
//!
//! # Architecture
//!
//! - [`InputManager`]: opens the store once, starts maintenance in run mode,
//!   turns configuration into runnable inputs
//! - [`ManagedInput`]: drives one configuration, one worker per source,
//!   behind the exclusive per-key lock
//! - [`Cursor`]: typed read access to a source's persisted state
//! - [`publish`]: event pipeline boundary with acknowledgment-gated cursor
//!   commits
//! - [`store`]: lockable, refcounted resources over the durable backend

mod cleaner;
mod config;
mod cursor;
mod input;
mod manager;
pub mod publish;
pub mod store;

pub use config::{ConfigError, InputSettings, DEFAULT_CLEANUP_INTERVAL, DEFAULT_CLEAN_TIMEOUT};
pub use cursor::Cursor;
pub use input::{source_key, Input, InputContext, ManagedInput, Source};
pub use manager::{Configure, InputError, InputManager, ResourceGuard, RunMode};
