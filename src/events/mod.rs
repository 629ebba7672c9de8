// src/events/mod.rs
//! Workload event model and event sources

pub mod event;
pub mod source;

pub use event::{
    CounterEvent, ErrorEvent, EventKind, ExecutionEvent, MessageEvent, TimeoutEvent, WaitSample,
    WaitStatsEvent, WorkloadEvent,
};
pub use source::{build_source, EventSource, SyntheticSource};
