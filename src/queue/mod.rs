// src/queue/mod.rs
//! Hybrid event buffering
//!
//! This module provides the bounded memory/disk queue that decouples event
//! producers from replay consumers:
//!
//! - **Hybrid Queue**: ring buffer + staging + compressed disk overflow
//! - **Segment Store**: one-file-per-chunk spill storage
//!
//! # Performance
//!
//! - **In-memory path**: one short mutex hold per operation, no I/O
//! - **Spill granularity**: half the ring capacity per segment
//! - **Disk I/O**: always outside the queue lock, one restore in flight
//!
//! # Architecture
//!
//! ```text
//! Producer → enqueue() → Ring (bounded) → try_dequeue() → Consumer
//!                          ↓ full                ↑
//!                       Staging            restore oldest
//!                          ↓ chunk               ↑
//!                       zstd segment files (FIFO)
//! ```

pub mod hybrid;
pub mod segment;

// Re-export commonly used types
pub use hybrid::{HybridEventQueue, QueueStats};
pub use segment::{CompressionLevel, SegmentStore};
