// src/utils/mod.rs
//! Common utilities: errors, configuration, backoff helpers

pub mod config;
pub mod errors;
pub mod spin;

pub use config::EngineConfig;
pub use errors::{EngineError, Result};
