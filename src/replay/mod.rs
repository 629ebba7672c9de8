// src/replay/mod.rs
//! Timed workload replay
//!
//! This module turns captured execution events back into live commands:
//!
//! - **Command**: classification of captured text (queries, connection
//!   resets, prepared-statement lifecycle) and handle substitution
//! - **Connection**: the target adapter seam and the simulated target
//! - **Timing**: capture-offset pacing with tiered waits and skip logic
//! - **Worker**: one per session, replays that session's commands in order
//! - **Registry**: routes events to workers and schedules them under the
//!   configured concurrency strategy
//!
//! # Architecture
//!
//! ```text
//! ExecutionEvent
//!       │ dispatch
//!       ▼
//! SessionRegistry ── idle sweeper
//!       │ per-session key
//!       ▼
//! ReplayWorker ──► DelayTimer (pace to capture offsets)
//!       │
//!       ▼
//! ReplayConnection (simulated target)
//! ```
//!
//! # Fidelity
//!
//! - **Ordering**: commands of one session never interleave or reorder
//! - **Pacing**: sub-5ms wait accuracy near the deadline, skip when behind
//! - **Context**: database switches and prepared handles tracked per session

pub mod command;
pub mod connection;
pub mod registry;
pub mod timing;
pub mod worker;

// Re-export commonly used types
pub use command::{classify, substitute_handle, CommandKind, ReplayCommand};
pub use connection::{
    build_factory, ConnectionFactory, ConnectionSettings, ExecutionLog, ReplayConnection,
    SimulatedConnectionFactory,
};
pub use registry::{RegistrySettings, RegistryStats, SessionRegistry};
pub use timing::{DelayMode, DelayTimer, WaitStrategy};
pub use worker::{ReplayWorker, SessionKey, WorkerSettings, WorkerState, WorkerStats};
