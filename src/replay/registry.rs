// src/replay/registry.rs
//! Session worker registry
//!
//! Routes execution events to per-session workers created on demand,
//! applies per-worker backpressure to producers, schedules drains under the
//! configured concurrency strategy, and sweeps idle workers so long runs do
//! not accumulate dead connections.
//!
//! # Architecture
//!
//! ```text
//! dispatch(event)
//!     │  session key = (session id, database[, application])
//!     ▼
//! DashMap<SessionKey, Worker> ──── idle sweeper (interval scan)
//!     │ append + kick                     │ stop + remove
//!     ▼                                   ▼
//! strategy: serial | worker-task | task-pool | task-per-command
//!                    (pool strategies gated by one global Semaphore)
//! ```

use crate::events::event::ExecutionEvent;
use crate::replay::command::ReplayCommand;
use crate::replay::connection::{ConnectionFactory, ConnectionSettings};
use crate::replay::worker::{ReplayWorker, SessionKey, WorkerSettings};
use crate::utils::config::{ReplayConfig, ReplayStrategy};
use crate::utils::errors::{EngineError, Result};
use crate::utils::spin;
use dashmap::DashMap;
use metrics::counter;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Registry-level behavior snapshot
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Worker scheduling strategy
    pub strategy: ReplayStrategy,

    /// Global cap on concurrently executing replay tasks
    pub max_concurrency: usize,

    /// Evict workers idle for longer than this
    pub idle_timeout: Duration,

    /// How often the sweeper scans for idle workers
    pub sweep_interval: Duration,

    /// Producer backpressure threshold per worker queue
    pub backpressure_threshold: usize,

    /// Present captured application names on replay connections
    pub mimic_application_name: bool,

    /// Capture database name to replay database name
    pub database_map: HashMap<String, String>,

    /// Per-worker behavior
    pub worker: WorkerSettings,
}

impl RegistrySettings {
    /// Derive registry settings from the replay config and queue sizing
    ///
    /// The backpressure threshold is 90% of the event buffer size, so a
    /// producer parks before any single session can absorb the whole buffer.
    pub fn from_config(cfg: &ReplayConfig, queue_buffer_size: usize) -> Self {
        Self {
            strategy: cfg.strategy,
            max_concurrency: cfg.max_concurrency.max(1),
            idle_timeout: Duration::from_millis(cfg.idle_timeout_ms),
            sweep_interval: Duration::from_millis(cfg.sweep_interval_ms),
            backpressure_threshold: ((queue_buffer_size * 9) / 10).max(1),
            mimic_application_name: cfg.mimic_application_name,
            database_map: cfg.database_map.clone(),
            worker: WorkerSettings::from_config(cfg),
        }
    }
}

/// Point-in-time registry statistics
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Workers currently registered
    pub workers_active: usize,

    /// Workers created since start
    pub workers_created: u64,

    /// Workers evicted by the idle sweeper
    pub workers_evicted: u64,

    /// Commands dispatched to workers
    pub dispatched: u64,

    /// Commands dropped because their session was halted
    pub dropped: u64,
}

/// Owns all session workers and their scheduling
pub struct SessionRegistry {
    workers: Arc<DashMap<SessionKey, Arc<ReplayWorker>>>,
    factory: Arc<dyn ConnectionFactory>,
    settings: RegistrySettings,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    sweeper: OnceCell<()>,
    dispatched: AtomicU64,
    workers_created: AtomicU64,
    workers_evicted: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl SessionRegistry {
    /// Create a registry; the idle sweeper starts with the first dispatch
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        settings: RegistrySettings,
        parent_cancel: &CancellationToken,
    ) -> Self {
        let permits = settings.max_concurrency.max(1);
        Self {
            workers: Arc::new(DashMap::new()),
            factory,
            settings,
            semaphore: Arc::new(Semaphore::new(permits)),
            cancel: parent_cancel.child_token(),
            tracker: TaskTracker::new(),
            sweeper: OnceCell::new(),
            dispatched: AtomicU64::new(0),
            workers_created: AtomicU64::new(0),
            workers_evicted: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Route one execution event to its session worker
    ///
    /// Applies backpressure when the session's queue is over threshold, then
    /// appends and schedules a drain per the configured strategy. With the
    /// serial strategy, execution happens inline and a stop-on-error failure
    /// propagates to the caller.
    pub async fn dispatch(&self, event: &ExecutionEvent) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Shutdown);
        }
        self.ensure_sweeper();

        let key = self.session_key(event);

        if let Some(worker) = self.workers.get(&key).map(|w| Arc::clone(w.value())) {
            if worker.pending() >= self.settings.backpressure_threshold {
                counter!("parrot_replay_backpressure_waits_total").increment(1);
                let threshold = self.settings.backpressure_threshold;
                let resumed = spin::wait_until(&self.cancel, || {
                    worker.pending() < threshold || worker.is_stopped()
                })
                .await;
                if !resumed {
                    return Err(EngineError::Shutdown);
                }
            }
        }

        let mut salvaged = vec![ReplayCommand::from_event(event, key.database.clone())];
        for _ in 0..3 {
            let worker = self.worker_for(&key, event);
            for cmd in salvaged.drain(..) {
                worker.append(cmd);
            }

            if !worker.is_stopped() {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                return self.kick(&worker).await;
            }

            // Error tombstones stay in the map so the halted session keeps
            // swallowing its commands until the sweeper collects it
            if worker.stopped_on_error() || self.cancel.is_cancelled() {
                let mut dropped = 0u64;
                while worker.take_next().is_some() {
                    dropped += 1;
                }
                self.dropped.fetch_add(dropped, Ordering::Relaxed);
                debug!("Dropped {} commands for halted {}", dropped, key);
                return Ok(());
            }

            // The worker was evicted between lookup and append. Drop the map
            // entry if it still points at it and move the stranded commands
            // to a fresh worker.
            self.workers
                .remove_if(&key, |_, w| Arc::ptr_eq(w, &worker));
            while let Some(cmd) = worker.take_next() {
                salvaged.push(cmd);
            }
            if salvaged.is_empty() {
                return Ok(());
            }
        }

        warn!("Gave up re-homing commands for {} after repeated evictions", key);
        self.dropped
            .fetch_add(salvaged.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Whether any worker still has queued or executing commands
    pub fn has_pending_work(&self) -> bool {
        self.workers
            .iter()
            .any(|w| (w.pending() > 0 && !w.is_stopped()) || w.is_running())
    }

    /// Workers currently registered
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            workers_active: self.workers.len(),
            workers_created: self.workers_created.load(Ordering::Relaxed),
            workers_evicted: self.workers_evicted.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop all workers and wait for replay tasks up to `grace`
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();

        let workers: Vec<_> = self
            .workers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for worker in workers {
            worker.stop().await;
        }

        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                "Replay tasks still running after {:?} shutdown grace",
                grace
            );
        }
        self.workers.clear();
    }

    fn session_key(&self, event: &ExecutionEvent) -> SessionKey {
        let database = self
            .settings
            .database_map
            .get(&event.database_name)
            .cloned()
            .unwrap_or_else(|| event.database_name.clone());
        let application = if self.settings.mimic_application_name
            && !event.application_name.is_empty()
        {
            Some(event.application_name.clone())
        } else {
            None
        };
        SessionKey {
            session_id: event.session_id,
            database,
            application,
        }
    }

    fn connection_settings(&self, key: &SessionKey, event: &ExecutionEvent) -> ConnectionSettings {
        ConnectionSettings {
            database: key.database.clone(),
            application_name: if self.settings.mimic_application_name {
                event.application_name.clone()
            } else {
                "parrot-replay".to_string()
            },
            login_name: event.login_name.clone(),
            host_name: event.host_name.clone(),
        }
    }

    fn worker_for(&self, key: &SessionKey, event: &ExecutionEvent) -> Arc<ReplayWorker> {
        if let Some(worker) = self.workers.get(key) {
            return Arc::clone(worker.value());
        }
        let entry = self.workers.entry(key.clone()).or_insert_with(|| {
            self.workers_created.fetch_add(1, Ordering::Relaxed);
            debug!("Creating worker for {}", key);
            Arc::new(ReplayWorker::new(
                key.clone(),
                self.connection_settings(key, event),
                Arc::clone(&self.factory),
                self.settings.worker.clone(),
                &self.cancel,
            ))
        });
        Arc::clone(entry.value())
    }

    /// Schedule a drain for the worker per the configured strategy
    async fn kick(&self, worker: &Arc<ReplayWorker>) -> Result<()> {
        match self.settings.strategy {
            ReplayStrategy::Serial => worker.run().await,
            ReplayStrategy::WorkerTask => {
                if worker.try_begin_run() {
                    let worker = Arc::clone(worker);
                    self.tracker.spawn(async move {
                        let _ = worker.run().await;
                    });
                }
                Ok(())
            }
            ReplayStrategy::TaskPool => {
                if worker.try_begin_run() {
                    let worker = Arc::clone(worker);
                    let semaphore = Arc::clone(&self.semaphore);
                    self.tracker.spawn(async move {
                        let _permit = match semaphore.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => return,
                        };
                        let _ = worker.run().await;
                    });
                }
                Ok(())
            }
            ReplayStrategy::TaskPerCommand => {
                let worker = Arc::clone(worker);
                let semaphore = Arc::clone(&self.semaphore);
                self.tracker.spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    let _ = worker.execute_next().await;
                });
                Ok(())
            }
        }
    }

    /// Start the idle sweeper once
    fn ensure_sweeper(&self) {
        self.sweeper.get_or_init(|| {
            let workers = Arc::clone(&self.workers);
            let cancel = self.cancel.clone();
            let evicted = Arc::clone(&self.workers_evicted);
            let dropped = Arc::clone(&self.dropped);
            let idle_timeout = self.settings.idle_timeout;
            let sweep_interval = self.settings.sweep_interval;

            self.tracker.spawn(async move {
                let mut ticker = tokio::time::interval(sweep_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = cancel.cancelled() => break,
                    }

                    let now = Instant::now();
                    let mut stale = Vec::new();
                    for entry in workers.iter() {
                        let worker = entry.value();
                        let idle_long_enough =
                            now.duration_since(worker.last_activity()) >= idle_timeout;
                        if idle_long_enough
                            && (worker.is_stopped()
                                || (worker.pending() == 0 && !worker.is_running()))
                        {
                            stale.push(entry.key().clone());
                        }
                    }

                    for key in stale {
                        // Re-check under the shard lock; a dispatch may still
                        // slip in between this removal and its own append,
                        // which the dispatch path detects and repairs
                        let removed = workers.remove_if(&key, |_, w| {
                            w.is_stopped() || (w.pending() == 0 && !w.is_running())
                        });
                        if let Some((_, worker)) = removed {
                            worker.stop().await;
                            evicted.fetch_add(1, Ordering::Relaxed);
                            counter!("parrot_replay_workers_evicted_total").increment(1);
                            debug!("Evicted idle worker for {}", key);

                            // An append that slipped in between removal and
                            // stop would otherwise strand its commands
                            let mut stranded = 0u64;
                            while worker.take_next().is_some() {
                                stranded += 1;
                            }
                            if stranded > 0 {
                                dropped.fetch_add(stranded, Ordering::Relaxed);
                                warn!(
                                    "Dropped {} commands appended to {} during eviction",
                                    stranded, key
                                );
                            }
                        }
                    }
                }
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event::ExecutionEvent;
    use crate::replay::connection::SimulatedConnectionFactory;
    use crate::replay::timing::{DelayMode, WaitStrategy};
    use crate::utils::config::SimulatedTargetConfig;

    fn fast_settings(strategy: ReplayStrategy) -> RegistrySettings {
        RegistrySettings {
            strategy,
            max_concurrency: 16,
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
            backpressure_threshold: 1_000,
            mimic_application_name: false,
            database_map: HashMap::new(),
            worker: WorkerSettings {
                command_timeout: Duration::from_millis(500),
                timeout_retries: 1,
                error_retries: 1,
                stop_on_error: false,
                surface_errors: false,
                delay_mode: DelayMode::Absolute,
                wait_strategy: WaitStrategy::default(),
            },
        }
    }

    fn make_registry(
        settings: RegistrySettings,
        profile: SimulatedTargetConfig,
    ) -> (SessionRegistry, Arc<SimulatedConnectionFactory>) {
        let factory = Arc::new(SimulatedConnectionFactory::new(profile));
        let cancel = CancellationToken::new();
        let registry = SessionRegistry::new(
            Arc::clone(&factory) as Arc<dyn ConnectionFactory>,
            settings,
            &cancel,
        );
        (registry, factory)
    }

    fn event(session_id: u64, database: &str, text: &str, offset_ms: u64) -> ExecutionEvent {
        ExecutionEvent::new(session_id, text)
            .with_database(database)
            .with_offset_ms(offset_ms)
    }

    async fn wait_for_drain(registry: &SessionRegistry) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.has_pending_work() {
            assert!(Instant::now() < deadline, "replay did not drain in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn assert_per_session_order(strategy: ReplayStrategy) {
        let (registry, factory) =
            make_registry(fast_settings(strategy), SimulatedTargetConfig::default());

        for n in 0..4 {
            registry
                .dispatch(&event(1, "one", &format!("s1 c{}", n), 0))
                .await
                .unwrap();
            registry
                .dispatch(&event(2, "two", &format!("s2 c{}", n), 0))
                .await
                .unwrap();
        }
        wait_for_drain(&registry).await;

        let log = factory.log();
        assert_eq!(
            log.texts_for_database("one"),
            vec!["s1 c0", "s1 c1", "s1 c2", "s1 c3"]
        );
        assert_eq!(
            log.texts_for_database("two"),
            vec!["s2 c0", "s2 c1", "s2 c2", "s2 c3"]
        );
        registry.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_serial_preserves_session_order() {
        assert_per_session_order(ReplayStrategy::Serial).await;
    }

    #[tokio::test]
    async fn test_worker_task_preserves_session_order() {
        assert_per_session_order(ReplayStrategy::WorkerTask).await;
    }

    #[tokio::test]
    async fn test_task_pool_preserves_session_order() {
        assert_per_session_order(ReplayStrategy::TaskPool).await;
    }

    #[tokio::test]
    async fn test_task_per_command_preserves_session_order() {
        assert_per_session_order(ReplayStrategy::TaskPerCommand).await;
    }

    #[tokio::test]
    async fn test_serial_offsets_pace_execution() {
        let (registry, factory) = make_registry(
            fast_settings(ReplayStrategy::Serial),
            SimulatedTargetConfig::default(),
        );

        let started = Instant::now();
        for (n, offset) in [0u64, 100, 250].iter().enumerate() {
            registry
                .dispatch(&event(7, "app", &format!("c{}", n), *offset))
                .await
                .unwrap();
        }
        let elapsed = started.elapsed();

        assert_eq!(factory.log().texts(), vec!["c0", "c1", "c2"]);
        assert!(elapsed >= Duration::from_millis(245), "ran early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(900), "ran late: {:?}", elapsed);
        registry.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_sessions_are_isolated_by_key() {
        let (registry, _factory) = make_registry(
            fast_settings(ReplayStrategy::WorkerTask),
            SimulatedTargetConfig::default(),
        );

        registry.dispatch(&event(1, "one", "a", 0)).await.unwrap();
        registry.dispatch(&event(2, "two", "b", 0)).await.unwrap();
        registry.dispatch(&event(1, "one", "c", 0)).await.unwrap();
        wait_for_drain(&registry).await;

        assert_eq!(registry.worker_count(), 2);
        let stats = registry.stats();
        assert_eq!(stats.workers_created, 2);
        assert_eq!(stats.dispatched, 3);
        registry.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_database_remap_applies_to_key_and_commands() {
        let mut settings = fast_settings(ReplayStrategy::Serial);
        settings
            .database_map
            .insert("prod".to_string(), "staging".to_string());
        let (registry, factory) = make_registry(settings, SimulatedTargetConfig::default());

        registry.dispatch(&event(5, "prod", "select 1", 0)).await.unwrap();
        assert_eq!(factory.log().texts_for_database("staging"), vec!["select 1"]);
        registry.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_idle_workers_are_evicted() {
        let mut settings = fast_settings(ReplayStrategy::WorkerTask);
        settings.idle_timeout = Duration::from_millis(150);
        settings.sweep_interval = Duration::from_millis(50);
        let (registry, factory) = make_registry(settings, SimulatedTargetConfig::default());

        registry.dispatch(&event(9, "app", "select 1", 0)).await.unwrap();
        wait_for_drain(&registry).await;
        assert_eq!(registry.worker_count(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.worker_count() > 0 {
            assert!(Instant::now() < deadline, "worker was never evicted");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(factory.closes(), 1);
        assert_eq!(registry.stats().workers_evicted, 1);

        // A later event for the same session starts a fresh worker
        registry.dispatch(&event(9, "app", "select 2", 0)).await.unwrap();
        wait_for_drain(&registry).await;
        assert_eq!(factory.log().texts(), vec!["select 1", "select 2"]);
        assert_eq!(factory.connects(), 2);
        registry.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stop_on_error_halts_session_and_drops_followups() {
        let mut settings = fast_settings(ReplayStrategy::Serial);
        settings.worker.stop_on_error = true;
        settings.worker.error_retries = 0;
        let profile = SimulatedTargetConfig {
            fail_matching: Some("poison".to_string()),
            ..SimulatedTargetConfig::default()
        };
        let (registry, factory) = make_registry(settings, profile);

        registry.dispatch(&event(3, "app", "select ok", 0)).await.unwrap();
        let err = registry
            .dispatch(&event(3, "app", "select poison", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CommandFailed(_)));

        // Later commands for the halted session are discarded
        registry.dispatch(&event(3, "app", "select after", 0)).await.unwrap();
        assert_eq!(factory.log().texts(), vec!["select ok"]);
        assert!(registry.stats().dropped >= 1);
        registry.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_backpressure_does_not_deadlock() {
        let mut settings = fast_settings(ReplayStrategy::WorkerTask);
        settings.backpressure_threshold = 2;
        let profile = SimulatedTargetConfig {
            latency_ms: 10,
            ..SimulatedTargetConfig::default()
        };
        let (registry, factory) = make_registry(settings, profile);

        for n in 0..10 {
            registry
                .dispatch(&event(4, "app", &format!("c{}", n), 0))
                .await
                .unwrap();
        }
        wait_for_drain(&registry).await;

        let expected: Vec<String> = (0..10).map(|n| format!("c{}", n)).collect();
        assert_eq!(factory.log().texts(), expected);
        registry.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_is_rejected() {
        let (registry, _factory) = make_registry(
            fast_settings(ReplayStrategy::WorkerTask),
            SimulatedTargetConfig::default(),
        );
        registry.shutdown(Duration::from_millis(100)).await;

        let err = registry.dispatch(&event(1, "app", "select 1", 0)).await;
        assert!(matches!(err, Err(EngineError::Shutdown)));
    }
}
