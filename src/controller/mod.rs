// src/controller/mod.rs
//! Workload controller and consumers
//!
//! This module wires the capture side to the replay side:
//!
//! - **Controller**: the read loop that pulls events from the source and
//!   fans each one out to every consumer
//! - **Consumer**: the consumer seam plus the replay consumer, which buffers
//!   through the hybrid queue and drains to the session registry
//! - **Summary**: a passive consumer that aggregates workload statistics
//!
//! # Architecture
//!
//! ```text
//! EventSource ──► WorkloadController
//!                       │ fan out
//!           ┌───────────┴───────────┐
//!           ▼                       ▼
//!     ReplayConsumer          WorkloadSummary
//!      (queue + registry)      (counters only)
//! ```

pub mod consumer;
pub mod controller;
pub mod summary;

// Re-export commonly used types
pub use consumer::{EventConsumer, ReplayConsumer};
pub use controller::{ControllerReport, WorkloadController};
pub use summary::{SummaryReport, WorkloadSummary};
