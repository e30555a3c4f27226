//! # Quay Core
//!
//! Error taxonomy and telemetry setup shared by every Quay crate.
//! Adapters, the resolver, the execution state machine and the worker loop
//! all report failures through [`QueueError`].

pub mod error;
pub mod telemetry;

pub use error::*;
pub use telemetry::*;
