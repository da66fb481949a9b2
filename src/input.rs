//! Managed inputs and the traits they are built from.
//!
//! - [`Source`] and [`Input`]: the contract a concrete input type implements
//! - [`InputContext`]: cancellation scope and identity of one run
//! - [`ManagedInput`]: runtime object driving one configuration's sources
//! - [`source_key`]: durable key composition for a source's cursor entry

mod managed;
mod traits;

pub use managed::{source_key, ManagedInput};
pub use traits::{Input, InputContext, Source};
