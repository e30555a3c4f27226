//! # Quay Config
//!
//! Settings for adapters, workers and default job policy.
//! Loaded from TOML files layered with `QUAY_` environment variables.

mod loader;
mod settings;

pub use loader::*;
pub use settings::*;
