// src/queue/hybrid.rs
//! Hybrid memory/disk event queue
//!
//! A bounded in-memory ring backed by a staging buffer and compressed disk
//! segments. Producers never block on disk capacity: when the ring is full,
//! events collect in staging and spill to disk one half-capacity chunk at a
//! time. Consumers always observe strict FIFO order across all three tiers:
//! ring first, then disk segments in spill order, then staging.
//!
//! Disk I/O happens outside the queue lock. A spilling producer registers
//! its segment sequence under the lock, writes the file, then marks the
//! segment ready; a restoring consumer claims the oldest ready segment under
//! the lock and reads it back with no lock held. At most one restore is in
//! flight at a time, which keeps the reserved ring room valid.

use crate::events::event::WorkloadEvent;
use crate::queue::segment::SegmentStore;
use crate::utils::config::QueueConfig;
use crate::utils::errors::{EngineError, Result};
use metrics::counter;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, warn};

/// One spilled chunk awaiting restore
struct SegmentSlot {
    /// Spill sequence, also the segment file name
    seq: u64,

    /// Set once the segment file is fully written
    ready: bool,
}

/// Lock-protected queue metadata
struct QueueInner {
    /// Oldest tier, served first
    ring: VecDeque<WorkloadEvent>,

    /// Newest tier, collects while the ring is full or disk is in use
    staging: Vec<WorkloadEvent>,

    /// Spilled chunks in FIFO order
    segments: VecDeque<SegmentSlot>,

    /// Events currently resident in segment files
    disk_events: usize,

    /// Next spill sequence number
    next_seq: u64,

    /// A consumer is restoring the front segment right now
    restore_in_flight: bool,
}

impl QueueInner {
    fn mark_ready(&mut self, seq: u64) {
        if let Some(slot) = self.segments.iter_mut().find(|s| s.seq == seq) {
            slot.ready = true;
        }
    }

    fn remove_slot(&mut self, seq: u64) {
        self.segments.retain(|s| s.seq != seq);
    }
}

/// Counters shared across producers and consumers
#[derive(Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    spilled_chunks: AtomicU64,
    restored_chunks: AtomicU64,
    spill_failures: AtomicU64,
    corruption_count: AtomicU64,
    lost_events: AtomicU64,
}

/// Bounded FIFO queue that overflows to compressed disk segments
pub struct HybridEventQueue {
    inner: Mutex<QueueInner>,
    store: SegmentStore,
    capacity: usize,
    chunk: usize,
    counters: QueueCounters,
}

enum DequeueAction {
    Deliver(WorkloadEvent, Option<u64>),
    Restore(u64),
    Empty,
}

impl HybridEventQueue {
    /// Create a queue with a fresh spill working directory
    pub fn new(cfg: &QueueConfig) -> Result<Self> {
        let store = SegmentStore::create(&cfg.spill_dir, cfg.compression)?;
        let capacity = cfg.buffer_size.max(2);
        Ok(Self {
            inner: Mutex::new(QueueInner {
                ring: VecDeque::with_capacity(capacity),
                staging: Vec::new(),
                segments: VecDeque::new(),
                disk_events: 0,
                next_seq: 0,
                restore_in_flight: false,
            }),
            store,
            capacity,
            chunk: (capacity / 2).max(1),
            counters: QueueCounters::default(),
        })
    }

    /// Append one event at the logical tail
    ///
    /// Fails only when a spill write fails, in which case the staged chunk
    /// is dropped rather than admitted out of order.
    pub fn enqueue(&self, event: WorkloadEvent) -> Result<()> {
        let spill = {
            let mut q = self.inner.lock();
            if q.staging.is_empty() && q.segments.is_empty() && q.ring.len() < self.capacity {
                q.ring.push_back(event);
                None
            } else {
                q.staging.push(event);
                if q.staging.len() >= self.chunk {
                    let free = self.capacity.saturating_sub(q.ring.len());
                    if q.segments.is_empty() && free >= self.chunk {
                        // Ring regained room before anything hit disk
                        let batch = std::mem::take(&mut q.staging);
                        q.ring.extend(batch);
                        None
                    } else {
                        let seq = q.next_seq;
                        q.next_seq += 1;
                        q.segments.push_back(SegmentSlot { seq, ready: false });
                        q.disk_events += self.chunk;
                        let batch =
                            std::mem::replace(&mut q.staging, Vec::with_capacity(self.chunk));
                        Some((seq, batch))
                    }
                } else {
                    None
                }
            }
        };

        if let Some((seq, batch)) = spill {
            if let Err(e) = self.store.write(seq, &batch) {
                let mut q = self.inner.lock();
                q.remove_slot(seq);
                q.disk_events = q.disk_events.saturating_sub(self.chunk);
                drop(q);

                self.counters.spill_failures.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .lost_events
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                counter!("parrot_queue_spill_failures_total").increment(1);
                error!("Failed to spill chunk {}: {}", seq, e);
                return Err(e);
            }

            self.inner.lock().mark_ready(seq);
            self.counters.spilled_chunks.fetch_add(1, Ordering::Relaxed);
            counter!("parrot_queue_spills_total").increment(1);
        }

        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Pop the logical head without blocking
    ///
    /// Returns `None` when no event is deliverable right now; that covers a
    /// genuinely empty queue, a restore still in flight on another task, and
    /// a corrupt segment that was discarded (visible in `stats`).
    pub fn try_dequeue(&self) -> Option<WorkloadEvent> {
        loop {
            let action = {
                let mut q = self.inner.lock();

                // Staging may only rejoin the ring once disk is empty and the
                // ring has drained well below capacity
                if q.segments.is_empty() && !q.staging.is_empty() {
                    let free = self.capacity.saturating_sub(q.ring.len());
                    if free * 4 >= self.capacity * 3 {
                        let batch = std::mem::take(&mut q.staging);
                        q.ring.extend(batch);
                    }
                }

                if let Some(event) = q.ring.pop_front() {
                    let prefetch = self.refill_candidate(&mut q);
                    DequeueAction::Deliver(event, prefetch)
                } else if let Some(seq) = self.refill_candidate(&mut q) {
                    DequeueAction::Restore(seq)
                } else {
                    DequeueAction::Empty
                }
            };

            match action {
                DequeueAction::Deliver(event, prefetch) => {
                    if let Some(seq) = prefetch {
                        self.restore_chunk(seq);
                    }
                    self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
                    return Some(event);
                }
                DequeueAction::Restore(seq) => {
                    self.restore_chunk(seq);
                }
                DequeueAction::Empty => return None,
            }
        }
    }

    /// Claim the oldest ready segment if the ring can hold it
    fn refill_candidate(&self, q: &mut QueueInner) -> Option<u64> {
        if q.restore_in_flight {
            return None;
        }
        let front = q.segments.front()?;
        if !front.ready {
            return None;
        }
        if self.capacity.saturating_sub(q.ring.len()) < self.chunk {
            return None;
        }
        q.restore_in_flight = true;
        Some(front.seq)
    }

    /// Read a claimed segment back into the ring; the file is deleted either way
    fn restore_chunk(&self, seq: u64) {
        let result = self.store.read(seq);
        if let Err(e) = self.store.delete(seq) {
            warn!("Failed to delete restored segment {}: {}", seq, e);
        }

        let mut q = self.inner.lock();
        q.segments.pop_front();
        q.disk_events = q.disk_events.saturating_sub(self.chunk);
        q.restore_in_flight = false;

        match result {
            Ok(events) if events.len() == self.chunk => {
                q.ring.extend(events);
                drop(q);
                self.counters.restored_chunks.fetch_add(1, Ordering::Relaxed);
                counter!("parrot_queue_restores_total").increment(1);
            }
            Ok(events) => {
                drop(q);
                self.record_corruption(seq, Some(events.len()));
            }
            Err(e) => {
                drop(q);
                error!("Failed to restore overflow segment {}: {}", seq, e);
                self.record_corruption(seq, None);
            }
        }
    }

    fn record_corruption(&self, seq: u64, actual: Option<usize>) {
        if let Some(actual) = actual {
            let err = EngineError::QueueCorruption {
                expected: self.chunk,
                actual,
            };
            error!("Discarding overflow segment {}: {}", seq, err);
        }
        self.counters.corruption_count.fetch_add(1, Ordering::Relaxed);
        self.counters
            .lost_events
            .fetch_add(self.chunk as u64, Ordering::Relaxed);
        counter!("parrot_queue_corruption_total").increment(1);
    }

    /// Total events across ring, staging, and disk
    pub fn len(&self) -> usize {
        let q = self.inner.lock();
        q.ring.len() + q.staging.len() + q.disk_events
    }

    /// Whether any event remains in any tier
    pub fn has_more(&self) -> bool {
        self.len() > 0
    }

    /// Whether all tiers are empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ring capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Spill chunk size (half the ring capacity)
    pub fn chunk_size(&self) -> usize {
        self.chunk
    }

    /// Spill working directory for this queue instance
    pub fn spill_dir(&self) -> &Path {
        self.store.dir()
    }

    /// Segment files currently on disk
    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    /// Snapshot queue statistics
    pub fn stats(&self) -> QueueStats {
        let (in_memory, staged, on_disk) = {
            let q = self.inner.lock();
            (q.ring.len(), q.staging.len(), q.disk_events)
        };
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dequeued: self.counters.dequeued.load(Ordering::Relaxed),
            spilled_chunks: self.counters.spilled_chunks.load(Ordering::Relaxed),
            restored_chunks: self.counters.restored_chunks.load(Ordering::Relaxed),
            spill_failures: self.counters.spill_failures.load(Ordering::Relaxed),
            corruption_count: self.counters.corruption_count.load(Ordering::Relaxed),
            lost_events: self.counters.lost_events.load(Ordering::Relaxed),
            in_memory,
            staged,
            on_disk,
            capacity: self.capacity,
        }
    }

    /// Drop all buffered events and delete the spill directory
    pub fn close(&self) -> Result<()> {
        {
            let mut q = self.inner.lock();
            q.ring.clear();
            q.staging.clear();
            q.segments.clear();
            q.disk_events = 0;
        }
        self.store.purge()
    }
}

impl Drop for HybridEventQueue {
    fn drop(&mut self) {
        if let Err(e) = self.store.purge() {
            warn!("Failed to purge spill directory on drop: {}", e);
        }
    }
}

/// Point-in-time queue statistics
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Events accepted
    pub enqueued: u64,

    /// Events delivered
    pub dequeued: u64,

    /// Chunks spilled to disk
    pub spilled_chunks: u64,

    /// Chunks restored from disk
    pub restored_chunks: u64,

    /// Spill writes that failed
    pub spill_failures: u64,

    /// Segments discarded as corrupt at restore time
    pub corruption_count: u64,

    /// Events lost to spill failures and corrupt segments
    pub lost_events: u64,

    /// Events in the ring
    pub in_memory: usize,

    /// Events in staging
    pub staged: usize,

    /// Events in segment files
    pub on_disk: usize,

    /// Ring capacity
    pub capacity: usize,
}

impl QueueStats {
    /// Total buffered events across all tiers
    pub fn depth(&self) -> usize {
        self.in_memory + self.staged + self.on_disk
    }

    /// Ring fill percentage
    pub fn fill_percentage(&self) -> f64 {
        (self.in_memory as f64 / self.capacity as f64) * 100.0
    }
}
