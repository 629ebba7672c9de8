// src/lib.rs
//! Parrot Workload Replay Engine Library
//!
//! This library provides the core components for capturing database workload
//! events and replaying them against a target with faithful per-session
//! ordering and timing.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **events**: Workload event model and event sources
//! - **queue**: Hybrid memory/disk event buffering with compressed spill
//! - **replay**: Session workers, timed execution, and the worker registry
//! - **controller**: The read loop that fans events out to consumers
//! - **observability**: Metrics, tracing, and logging
//! - **utils**: Configuration, errors, and common helpers

// Public module exports
pub mod controller;
pub mod events;
pub mod observability;
pub mod queue;
pub mod replay;
pub mod utils;

// Re-export commonly used types
pub use controller::consumer::{EventConsumer, ReplayConsumer};
pub use controller::controller::{ControllerReport, WorkloadController};
pub use events::event::{ExecutionEvent, WorkloadEvent};
pub use queue::hybrid::HybridEventQueue;
pub use replay::registry::SessionRegistry;
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert!(!info.version.is_empty());
    }
}
