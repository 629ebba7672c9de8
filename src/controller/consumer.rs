// src/controller/consumer.rs
//! Event consumers
//!
//! The controller fans every captured event out to a set of consumers. The
//! replay consumer is the primary one: it buffers events through the hybrid
//! queue and drains them to the session registry on a background task, so a
//! bursty source is absorbed by the buffer instead of blocking on replay
//! pacing.

use crate::events::event::WorkloadEvent;
use crate::queue::hybrid::{HybridEventQueue, QueueStats};
use crate::replay::connection::ConnectionFactory;
use crate::replay::registry::{RegistrySettings, RegistryStats, SessionRegistry};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives every event the controller reads from the source
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Accept one event; heavy work belongs on the consumer's own tasks
    async fn accept(&self, event: &WorkloadEvent) -> Result<()>;

    /// Whether buffered or in-flight work remains
    fn has_pending_work(&self) -> bool;

    /// Flush remaining work and release resources
    async fn shutdown(&self);
}

/// Replays execution events against the target through the session registry
pub struct ReplayConsumer {
    queue: Arc<HybridEventQueue>,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
    poll_interval: Duration,
    shutdown_grace: Duration,
    drain_started: OnceCell<()>,
    drain_handle: Mutex<Option<JoinHandle<()>>>,
    skipped: Arc<AtomicU64>,
    dispatch_failures: Arc<AtomicU64>,
}

impl ReplayConsumer {
    /// Build the consumer, its buffer queue, and its session registry
    pub fn new(
        cfg: &EngineConfig,
        factory: Arc<dyn ConnectionFactory>,
        parent_cancel: &CancellationToken,
    ) -> Result<Self> {
        let queue = Arc::new(HybridEventQueue::new(&cfg.queue)?);
        let registry = Arc::new(SessionRegistry::new(
            factory,
            RegistrySettings::from_config(&cfg.replay, cfg.queue.buffer_size),
            parent_cancel,
        ));
        Ok(Self {
            queue,
            registry,
            cancel: parent_cancel.child_token(),
            poll_interval: Duration::from_millis(cfg.controller.poll_interval_ms),
            shutdown_grace: Duration::from_millis(cfg.controller.shutdown_grace_ms),
            drain_started: OnceCell::new(),
            drain_handle: Mutex::new(None),
            skipped: Arc::new(AtomicU64::new(0)),
            dispatch_failures: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Buffer depth and spill statistics
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Registry worker and dispatch statistics
    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Non-execution events observed and dropped from the replay path
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Dispatches that failed terminally
    pub fn dispatch_failures(&self) -> u64 {
        self.dispatch_failures.load(Ordering::Relaxed)
    }

    /// Start the drain task once
    fn ensure_drain(&self) {
        self.drain_started.get_or_init(|| {
            let queue = Arc::clone(&self.queue);
            let registry = Arc::clone(&self.registry);
            let cancel = self.cancel.clone();
            let poll_interval = self.poll_interval;
            let skipped = Arc::clone(&self.skipped);
            let dispatch_failures = Arc::clone(&self.dispatch_failures);

            let handle = tokio::spawn(async move {
                loop {
                    match queue.try_dequeue() {
                        Some(WorkloadEvent::Execution(event)) => {
                            match registry.dispatch(&event).await {
                                Ok(()) => {}
                                Err(EngineError::Shutdown) => break,
                                Err(e) => {
                                    dispatch_failures.fetch_add(1, Ordering::Relaxed);
                                    warn!(
                                        "Replay of session {} halted: {}",
                                        event.session_id, e
                                    );
                                }
                            }
                        }
                        Some(other) => {
                            skipped.fetch_add(1, Ordering::Relaxed);
                            debug!("Not replaying {} event", other.kind().as_str());
                        }
                        None => {
                            if cancel.is_cancelled() {
                                break;
                            }
                            tokio::select! {
                                _ = tokio::time::sleep(poll_interval) => {}
                                _ = cancel.cancelled() => {}
                            }
                        }
                    }
                }
                debug!("Replay drain task exited");
            });
            *self.drain_handle.lock() = Some(handle);
        });
    }
}

#[async_trait]
impl EventConsumer for ReplayConsumer {
    fn name(&self) -> &str {
        "replay"
    }

    async fn accept(&self, event: &WorkloadEvent) -> Result<()> {
        self.ensure_drain();
        self.queue.enqueue(event.clone())
    }

    fn has_pending_work(&self) -> bool {
        !self.queue.is_empty() || self.registry.has_pending_work()
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.drain_handle.lock().take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                warn!("Replay drain task panicked");
            }
        }
        self.registry.shutdown(self.shutdown_grace).await;
        if let Err(e) = self.queue.close() {
            warn!("Failed to close replay buffer: {}", e);
        }

        let stats = self.registry.stats();
        info!(
            "Replay consumer stopped: {} dispatched, {} skipped, {} dropped, {} failures",
            stats.dispatched,
            self.skipped.load(Ordering::Relaxed),
            stats.dropped,
            self.dispatch_failures.load(Ordering::Relaxed)
        );
    }
}
