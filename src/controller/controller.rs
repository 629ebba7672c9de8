// src/controller/controller.rs
//! Workload controller
//!
//! The controller owns the read loop: pull one event from the source, fan it
//! out to every consumer, and repeat until the source is exhausted and the
//! consumers have drained, or until cancellation. Consumer failures are
//! isolated per event so one misbehaving consumer cannot stall the others.

use crate::controller::consumer::EventConsumer;
use crate::events::event::WorkloadEvent;
use crate::events::source::EventSource;
use crate::utils::config::ControllerConfig;
use crate::utils::errors::Result;
use futures::future;
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Outcome of one controller run
#[derive(Debug, Clone)]
pub struct ControllerReport {
    /// Events read from the source
    pub events_read: u64,

    /// Individual consumer accept failures
    pub fanout_failures: u64,

    /// Terminal source read errors
    pub source_errors: u64,

    /// Wall-clock duration of the run
    pub elapsed: Duration,
}

/// Reads the source and fans events out to consumers
pub struct WorkloadController {
    source: tokio::sync::Mutex<Box<dyn EventSource>>,
    consumers: Vec<Arc<dyn EventConsumer>>,
    cancel: CancellationToken,
    poll_interval: Duration,
    shutdown_grace: Duration,
    events_read: AtomicU64,
    fanout_failures: AtomicU64,
    source_errors: AtomicU64,
}

impl WorkloadController {
    /// Create a controller over one source; consumers attach before `run`
    pub fn new(
        source: Box<dyn EventSource>,
        cfg: &ControllerConfig,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            source: tokio::sync::Mutex::new(source),
            consumers: Vec::new(),
            cancel: cancel.clone(),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            shutdown_grace: Duration::from_millis(cfg.shutdown_grace_ms),
            events_read: AtomicU64::new(0),
            fanout_failures: AtomicU64::new(0),
            source_errors: AtomicU64::new(0),
        }
    }

    /// Attach a consumer; every event goes to every consumer
    pub fn add_consumer(&mut self, consumer: Arc<dyn EventConsumer>) {
        self.consumers.push(consumer);
    }

    /// Token that stops the run when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Read until the source ends and consumers drain, then shut down
    pub async fn run(&self) -> Result<ControllerReport> {
        let started = Instant::now();
        info!("Controller starting with {} consumers", self.consumers.len());

        let mut source = self.source.lock().await;
        loop {
            if self.cancel.is_cancelled() {
                info!("Controller cancelled");
                break;
            }

            match source.read().await {
                Ok(Some(event)) => {
                    self.events_read.fetch_add(1, Ordering::Relaxed);
                    counter!("parrot_events_read_total").increment(1);
                    self.fan_out(&event).await;
                }
                Ok(None) => {
                    if !source.is_running() && !self.any_pending() {
                        info!("Source exhausted and consumers drained");
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = self.cancel.cancelled() => {}
                    }
                }
                Err(e) => {
                    error!("Source failed, draining what was buffered: {}", e);
                    self.source_errors.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }
        drop(source);

        if !self.cancel.is_cancelled() {
            self.drain_grace().await;
        }
        for consumer in &self.consumers {
            consumer.shutdown().await;
            info!("Consumer {} stopped", consumer.name());
        }

        let report = ControllerReport {
            events_read: self.events_read.load(Ordering::Relaxed),
            fanout_failures: self.fanout_failures.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
        };
        info!(
            "Controller finished: {} events in {:.1}s",
            report.events_read,
            report.elapsed.as_secs_f64()
        );
        Ok(report)
    }

    /// Deliver one event to every consumer, isolating failures
    async fn fan_out(&self, event: &WorkloadEvent) {
        let results =
            future::join_all(self.consumers.iter().map(|c| c.accept(event))).await;
        for (consumer, result) in self.consumers.iter().zip(results) {
            if let Err(e) = result {
                self.fanout_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Consumer {} rejected event: {}", consumer.name(), e);
            }
        }
    }

    fn any_pending(&self) -> bool {
        self.consumers.iter().any(|c| c.has_pending_work())
    }

    /// Give consumers a bounded window to finish buffered work
    async fn drain_grace(&self) {
        let deadline = Instant::now() + self.shutdown_grace;
        while self.any_pending() && Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval).await;
        }
        if self.any_pending() {
            warn!(
                "Consumers still busy after {:?} shutdown grace",
                self.shutdown_grace
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::consumer::ReplayConsumer;
    use crate::events::event::ExecutionEvent;
    use crate::events::source::SyntheticSource;
    use crate::replay::connection::{ConnectionFactory, SimulatedConnectionFactory};
    use crate::utils::config::{EngineConfig, SyntheticConfig};
    use crate::utils::errors::EngineError;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct ScriptedSource {
        events: VecDeque<WorkloadEvent>,
    }

    impl ScriptedSource {
        fn new(events: Vec<WorkloadEvent>) -> Self {
            Self {
                events: events.into(),
            }
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn read(&mut self) -> Result<Option<WorkloadEvent>> {
            Ok(self.events.pop_front())
        }

        fn is_running(&self) -> bool {
            !self.events.is_empty()
        }
    }

    /// Never yields anything but never ends either
    struct StallingSource;

    #[async_trait]
    impl EventSource for StallingSource {
        async fn read(&mut self) -> Result<Option<WorkloadEvent>> {
            Ok(None)
        }

        fn is_running(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct CountingConsumer {
        seen: AtomicU64,
    }

    #[async_trait]
    impl EventConsumer for CountingConsumer {
        fn name(&self) -> &str {
            "counting"
        }

        async fn accept(&self, _event: &WorkloadEvent) -> Result<()> {
            self.seen.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn has_pending_work(&self) -> bool {
            false
        }

        async fn shutdown(&self) {}
    }

    struct FailingConsumer;

    #[async_trait]
    impl EventConsumer for FailingConsumer {
        fn name(&self) -> &str {
            "failing"
        }

        async fn accept(&self, _event: &WorkloadEvent) -> Result<()> {
            Err(EngineError::CommandFailed("refused".to_string()))
        }

        fn has_pending_work(&self) -> bool {
            false
        }

        async fn shutdown(&self) {}
    }

    fn fast_controller_config() -> ControllerConfig {
        ControllerConfig {
            poll_interval_ms: 5,
            shutdown_grace_ms: 2_000,
            enable_summary: false,
        }
    }

    fn execution(session_id: u64, database: &str, text: &str) -> WorkloadEvent {
        WorkloadEvent::Execution(
            ExecutionEvent::new(session_id, text).with_database(database),
        )
    }

    #[tokio::test]
    async fn test_fans_out_every_event() {
        let events = vec![
            execution(1, "app", "select 1"),
            execution(2, "app", "select 2"),
            execution(1, "app", "select 3"),
        ];
        let cancel = CancellationToken::new();
        let mut controller = WorkloadController::new(
            Box::new(ScriptedSource::new(events)),
            &fast_controller_config(),
            &cancel,
        );
        let counting = Arc::new(CountingConsumer::default());
        controller.add_consumer(Arc::clone(&counting) as Arc<dyn EventConsumer>);

        let report = controller.run().await.unwrap();
        assert_eq!(report.events_read, 3);
        assert_eq!(counting.seen.load(Ordering::Relaxed), 3);
        assert_eq!(report.fanout_failures, 0);
    }

    #[tokio::test]
    async fn test_consumer_failure_is_isolated() {
        let events = vec![
            execution(1, "app", "select 1"),
            execution(1, "app", "select 2"),
        ];
        let cancel = CancellationToken::new();
        let mut controller = WorkloadController::new(
            Box::new(ScriptedSource::new(events)),
            &fast_controller_config(),
            &cancel,
        );
        let counting = Arc::new(CountingConsumer::default());
        controller.add_consumer(Arc::new(FailingConsumer) as Arc<dyn EventConsumer>);
        controller.add_consumer(Arc::clone(&counting) as Arc<dyn EventConsumer>);

        let report = controller.run().await.unwrap();
        assert_eq!(report.events_read, 2);
        assert_eq!(report.fanout_failures, 2);
        assert_eq!(counting.seen.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_an_idle_run() {
        let cancel = CancellationToken::new();
        let controller = Arc::new(WorkloadController::new(
            Box::new(StallingSource),
            &fast_controller_config(),
            &cancel,
        ));

        let runner = Arc::clone(&controller);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let report = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.events_read, 0);
    }

    #[tokio::test]
    async fn test_replays_scripted_workload_end_to_end() {
        let events = vec![
            execution(1, "one", "s1 c0"),
            execution(2, "two", "s2 c0"),
            execution(1, "one", "s1 c1"),
            execution(2, "two", "s2 c1"),
        ];

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = EngineConfig::default();
        cfg.queue.spill_dir = dir.path().to_path_buf();
        cfg.queue.buffer_size = 32;
        cfg.controller = fast_controller_config();
        cfg.replay.command_timeout_ms = 500;

        let factory = Arc::new(SimulatedConnectionFactory::new(cfg.target.simulated.clone()));
        let cancel = CancellationToken::new();
        let consumer = Arc::new(
            ReplayConsumer::new(
                &cfg,
                Arc::clone(&factory) as Arc<dyn ConnectionFactory>,
                &cancel,
            )
            .unwrap(),
        );

        let mut controller = WorkloadController::new(
            Box::new(ScriptedSource::new(events)),
            &cfg.controller,
            &cancel,
        );
        controller.add_consumer(Arc::clone(&consumer) as Arc<dyn EventConsumer>);

        let report = controller.run().await.unwrap();
        assert_eq!(report.events_read, 4);

        let log = factory.log();
        assert_eq!(log.texts_for_database("one"), vec!["s1 c0", "s1 c1"]);
        assert_eq!(log.texts_for_database("two"), vec!["s2 c0", "s2 c1"]);
        assert!(!consumer.has_pending_work());
        assert_eq!(factory.closes(), factory.connects());
    }

    #[tokio::test]
    async fn test_synthetic_workload_replays_fully() {
        let synthetic = SyntheticConfig {
            sessions: 2,
            commands_per_session: 5,
            command_spacing_ms: 0,
            seed: 11,
            databases: vec!["app".to_string()],
            include_noise: false,
        };

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = EngineConfig::default();
        cfg.queue.spill_dir = dir.path().to_path_buf();
        cfg.queue.buffer_size = 32;
        cfg.controller = fast_controller_config();
        cfg.replay.command_timeout_ms = 500;

        let factory = Arc::new(SimulatedConnectionFactory::new(cfg.target.simulated.clone()));
        let cancel = CancellationToken::new();
        let consumer = Arc::new(
            ReplayConsumer::new(
                &cfg,
                Arc::clone(&factory) as Arc<dyn ConnectionFactory>,
                &cancel,
            )
            .unwrap(),
        );

        let mut controller = WorkloadController::new(
            Box::new(SyntheticSource::new(synthetic)),
            &cfg.controller,
            &cancel,
        );
        controller.add_consumer(Arc::clone(&consumer) as Arc<dyn EventConsumer>);

        let report = controller.run().await.unwrap();
        assert_eq!(report.events_read, 10);
        assert_eq!(consumer.registry_stats().dispatched, 10);
        assert!(!factory.log().is_empty());
        assert!(!consumer.has_pending_work());
    }
}
