// src/controller/summary.rs
//! Workload summary consumer
//!
//! Passive consumer that aggregates what flowed through the controller:
//! event counts by kind, execution counts by database, and cumulative
//! resource usage. Logged once at shutdown and queryable as a report.

use crate::controller::consumer::EventConsumer;
use crate::events::event::{EventKind, WorkloadEvent};
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::info;

/// Aggregated view of one workload run
#[derive(Debug, Clone, Default)]
pub struct SummaryReport {
    /// Total events observed
    pub total_events: u64,

    /// Event counts by kind label
    pub by_kind: HashMap<&'static str, u64>,

    /// Execution counts by originating database
    pub by_database: HashMap<String, u64>,

    /// Cumulative logical reads across executions
    pub reads: i64,

    /// Cumulative logical writes across executions
    pub writes: i64,

    /// Cumulative CPU milliseconds across executions
    pub cpu_ms: i64,

    /// Capture-side span between first and last event, in milliseconds
    pub span_ms: i64,
}

/// Counts every event it sees; replays nothing
#[derive(Default)]
pub struct WorkloadSummary {
    total: AtomicU64,
    by_kind: DashMap<EventKind, u64>,
    by_database: DashMap<String, u64>,
    reads: AtomicI64,
    writes: AtomicI64,
    cpu_ms: AtomicI64,
    span: Mutex<Option<(DateTime<Utc>, DateTime<Utc>)>>,
}

impl WorkloadSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the aggregates
    pub fn report(&self) -> SummaryReport {
        let by_kind = self
            .by_kind
            .iter()
            .map(|entry| (entry.key().as_str(), *entry.value()))
            .collect();
        let by_database = self
            .by_database
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        let span_ms = self
            .span
            .lock()
            .as_ref()
            .map(|(first, last)| (*last - *first).num_milliseconds())
            .unwrap_or(0);

        SummaryReport {
            total_events: self.total.load(Ordering::Relaxed),
            by_kind,
            by_database,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            cpu_ms: self.cpu_ms.load(Ordering::Relaxed),
            span_ms,
        }
    }
}

#[async_trait]
impl EventConsumer for WorkloadSummary {
    fn name(&self) -> &str {
        "summary"
    }

    async fn accept(&self, event: &WorkloadEvent) -> Result<()> {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.by_kind.entry(event.kind()).or_insert(0) += 1;

        let at = event.start_time();
        {
            let mut span = self.span.lock();
            *span = match *span {
                None => Some((at, at)),
                Some((first, last)) => Some((first.min(at), last.max(at))),
            };
        }

        if let WorkloadEvent::Execution(exec) = event {
            *self
                .by_database
                .entry(exec.database_name.clone())
                .or_insert(0) += 1;
            self.reads.fetch_add(exec.reads, Ordering::Relaxed);
            self.writes.fetch_add(exec.writes, Ordering::Relaxed);
            self.cpu_ms.fetch_add(exec.cpu_ms, Ordering::Relaxed);
        }
        Ok(())
    }

    fn has_pending_work(&self) -> bool {
        false
    }

    async fn shutdown(&self) {
        let report = self.report();
        info!(
            "Workload summary: {} events over {}ms of capture",
            report.total_events, report.span_ms
        );
        for (kind, count) in &report.by_kind {
            info!("  {:>10}: {}", kind, count);
        }
        for (database, count) in &report.by_database {
            info!("  database {}: {} executions", database, count);
        }
        info!(
            "  resources: {} reads, {} writes, {}ms cpu",
            report.reads, report.writes, report.cpu_ms
        );
    }
}
