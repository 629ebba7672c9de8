// src/replay/worker.rs
//! Per-session replay worker
//!
//! One worker owns one capture session: a FIFO command queue, one lazily
//! opened target connection, the session's delay timer, and the map from
//! capture-side prepared-statement placeholders to live handles. All
//! execution paths serialize on the worker's inner mutex, so commands of a
//! session never interleave regardless of dispatch strategy.
//!
//! Lifecycle: NotStarted -> Running <-> Idle -> Stopped. The transition into
//! Stopped happens exactly once and releases the connection exactly once,
//! whether it is driven by stop-on-error teardown, idle eviction, or engine
//! shutdown.

use crate::replay::command::{substitute_handle, CommandKind, ReplayCommand};
use crate::replay::connection::{ConnectionFactory, ConnectionSettings};
use crate::replay::timing::{DelayMode, DelayTimer, WaitStrategy};
use crate::utils::config::ReplayConfig;
use crate::utils::errors::{EngineError, Result};
use crossbeam::queue::SegQueue;
use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Identity of one replayed session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Capture-side session identifier
    pub session_id: u64,

    /// Replay-side database (after remapping)
    pub database: String,

    /// Application name, when sessions are partitioned by application
    pub application: Option<String>,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.application {
            Some(app) => write!(f, "session {} [{}] on {}", self.session_id, app, self.database),
            None => write!(f, "session {} on {}", self.session_id, self.database),
        }
    }
}

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Running,
    Idle,
    Stopped,
}

const STATE_NOT_STARTED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_IDLE: u8 = 2;
const STATE_STOPPED: u8 = 3;

fn state_from(raw: u8) -> WorkerState {
    match raw {
        STATE_RUNNING => WorkerState::Running,
        STATE_IDLE => WorkerState::Idle,
        STATE_STOPPED => WorkerState::Stopped,
        _ => WorkerState::NotStarted,
    }
}

/// Per-worker behavior snapshot taken from `ReplayConfig`
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Per-command execution timeout; zero disables it
    pub command_timeout: Duration,

    /// Retry budget for timed-out commands
    pub timeout_retries: u32,

    /// Retry budget for failed commands
    pub error_retries: u32,

    /// Tear the worker down on the first exhausted budget
    pub stop_on_error: bool,

    /// Execute a marker statement for every exhausted failure
    pub surface_errors: bool,

    /// Delay derivation mode
    pub delay_mode: DelayMode,

    /// Wait tiering and skip thresholds
    pub wait_strategy: WaitStrategy,
}

impl WorkerSettings {
    /// Snapshot the worker-relevant parts of the replay config
    pub fn from_config(cfg: &ReplayConfig) -> Self {
        Self {
            command_timeout: Duration::from_millis(cfg.command_timeout_ms),
            timeout_retries: cfg.timeout_retries,
            error_retries: cfg.error_retries,
            stop_on_error: cfg.stop_on_error,
            surface_errors: cfg.surface_errors,
            delay_mode: if cfg.relative_delays {
                DelayMode::Relative
            } else {
                DelayMode::Absolute
            },
            wait_strategy: WaitStrategy {
                skip_threshold: Duration::from_millis(cfg.skip_threshold_ms),
                warn_interval: Duration::from_millis(cfg.warn_interval_ms),
                ..WaitStrategy::default()
            },
        }
    }
}

/// Mutable state touched only while holding the worker's inner mutex
struct WorkerInner {
    conn: Option<Box<dyn crate::replay::connection::ReplayConnection>>,
    timer: DelayTimer,
    handles: HashMap<i64, i64>,
    current_database: String,
    skip_next_delay: bool,
}

#[derive(Default)]
struct WorkerCounters {
    executed: AtomicU64,
    retried: AtomicU64,
    abandoned: AtomicU64,
    unknown_handles: AtomicU64,
    delays_skipped: AtomicU64,
}

/// Snapshot of one worker's counters
#[derive(Debug, Clone)]
pub struct WorkerStats {
    /// Commands completed successfully
    pub executed: u64,

    /// Retry attempts across all commands
    pub retried: u64,

    /// Commands abandoned after their budgets ran out
    pub abandoned: u64,

    /// Handle executions dropped for lack of a live handle
    pub unknown_handles: u64,

    /// Delays skipped because replay fell behind schedule
    pub delays_skipped: u64,
}

/// Replays one session's commands in order
pub struct ReplayWorker {
    key: SessionKey,
    settings: WorkerSettings,
    conn_settings: ConnectionSettings,
    factory: Arc<dyn ConnectionFactory>,
    queue: SegQueue<ReplayCommand>,
    pending: AtomicUsize,
    state: AtomicU8,
    stopped_on_error: AtomicBool,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
    inner: tokio::sync::Mutex<WorkerInner>,
    counters: WorkerCounters,
}

impl ReplayWorker {
    /// Create a worker; the connection opens lazily on the first command
    pub fn new(
        key: SessionKey,
        conn_settings: ConnectionSettings,
        factory: Arc<dyn ConnectionFactory>,
        settings: WorkerSettings,
        parent_cancel: &CancellationToken,
    ) -> Self {
        let timer = DelayTimer::new(settings.delay_mode, settings.wait_strategy.clone());
        let initial_database = conn_settings.database.clone();
        Self {
            key,
            settings,
            conn_settings,
            factory,
            queue: SegQueue::new(),
            pending: AtomicUsize::new(0),
            state: AtomicU8::new(STATE_NOT_STARTED),
            stopped_on_error: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            cancel: parent_cancel.child_token(),
            inner: tokio::sync::Mutex::new(WorkerInner {
                conn: None,
                timer,
                handles: HashMap::new(),
                current_database: initial_database,
                skip_next_delay: false,
            }),
            counters: WorkerCounters::default(),
        }
    }

    /// Session identity
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Queue a command at the session's tail
    pub fn append(&self, cmd: ReplayCommand) {
        self.queue.push(cmd);
        self.pending.fetch_add(1, Ordering::SeqCst);
        *self.last_activity.lock() = Instant::now();
    }

    /// Commands queued or currently executing
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        state_from(self.state.load(Ordering::SeqCst))
    }

    /// Whether a drain is active
    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Whether the worker has been torn down
    pub fn is_stopped(&self) -> bool {
        self.state() == WorkerState::Stopped
    }

    /// Whether teardown was caused by an exhausted command failure
    ///
    /// Such a worker is a tombstone: the session is halted and later
    /// commands for it are dropped rather than replayed out of context.
    pub fn stopped_on_error(&self) -> bool {
        self.stopped_on_error.load(Ordering::SeqCst)
    }

    /// Pull one queued command back out, adjusting the pending count
    ///
    /// Used to move stranded commands off a worker that stopped between
    /// lookup and append.
    pub fn take_next(&self) -> Option<ReplayCommand> {
        let cmd = self.queue.pop()?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(cmd)
    }

    /// When the worker last accepted or finished a command
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Counter snapshot
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            executed: self.counters.executed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            unknown_handles: self.counters.unknown_handles.load(Ordering::Relaxed),
            delays_skipped: self.counters.delays_skipped.load(Ordering::Relaxed),
        }
    }

    /// Claim the drain role: NotStarted/Idle -> Running
    ///
    /// Returns `false` when a drain is already active or the worker stopped,
    /// so dispatchers spawn at most one drain task at a time.
    pub fn try_begin_run(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_NOT_STARTED,
                STATE_RUNNING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
            || self
                .state
                .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    fn mark_running(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::SeqCst);
            match current {
                STATE_STOPPED => return false,
                STATE_RUNNING => return true,
                _ => {
                    if self
                        .state
                        .compare_exchange(current, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        return true;
                    }
                }
            }
        }
    }

    fn mark_idle(&self) {
        let _ = self.state.compare_exchange(
            STATE_RUNNING,
            STATE_IDLE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Drain the queue until empty, stopped, or cancelled
    pub async fn run(&self) -> Result<()> {
        if !self.mark_running() {
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        let result = loop {
            let drained = loop {
                if self.cancel.is_cancelled() || self.is_stopped() {
                    break Ok(());
                }
                let cmd = match self.queue.pop() {
                    Some(cmd) => cmd,
                    None => break Ok(()),
                };
                let outcome = self.process(&mut inner, cmd).await;
                if let Err(e) = self.finish_command(&mut inner, outcome).await {
                    break Err(e);
                }
            };

            if drained.is_err() || self.is_stopped() || self.cancel.is_cancelled() {
                break drained;
            }
            self.mark_idle();

            // An append may have raced the empty observation above; reclaim
            // the running role instead of stranding it until the next dispatch
            if self.queue.is_empty() || !self.try_begin_run() {
                break Ok(());
            }
        };

        if self.is_stopped() {
            self.release_connection(&mut inner).await;
        }
        result
    }

    /// Execute at most one queued command (task-per-command dispatch)
    pub async fn execute_next(&self) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        let cmd = match self.queue.pop() {
            Some(cmd) => cmd,
            None => return Ok(()),
        };
        let outcome = self.process(&mut inner, cmd).await;
        let result = self.finish_command(&mut inner, outcome).await;

        if self.is_stopped() {
            self.release_connection(&mut inner).await;
        }
        result
    }

    /// Tear the worker down and release its connection
    ///
    /// Idempotent; the connection closes exactly once, either here or on the
    /// exit path of an active drain that observes the stopped state.
    pub async fn stop(&self) {
        let prev = self.state.swap(STATE_STOPPED, Ordering::SeqCst);
        self.cancel.cancel();
        if prev == STATE_STOPPED {
            return;
        }
        if let Ok(mut inner) = self.inner.try_lock() {
            self.release_connection(&mut inner).await;
        }
    }

    async fn process(&self, inner: &mut WorkerInner, cmd: ReplayCommand) -> Result<()> {
        let kind = cmd.kind();

        if inner.skip_next_delay {
            inner.skip_next_delay = false;
            inner.timer.mark(cmd.replay_offset_ms);
        } else {
            let outcome = inner.timer.wait_for(cmd.replay_offset_ms, &self.cancel).await;
            if outcome.skipped {
                self.counters.delays_skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        match self.run_with_retries(inner, &cmd, kind).await {
            Ok(()) => {
                if matches!(kind, CommandKind::ResetConnection { .. }) {
                    inner.skip_next_delay = true;
                }
                self.counters.executed.fetch_add(1, Ordering::Relaxed);
                counter!("parrot_replay_commands_total").increment(1);
                Ok(())
            }
            Err(e) => {
                self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                counter!("parrot_replay_commands_failed_total").increment(1);
                error!(
                    "Command {} on {} failed after retries: {}",
                    cmd.sequence, self.key, e
                );
                if self.settings.surface_errors {
                    self.surface_marker(inner, &cmd, &e).await;
                }
                if self.settings.stop_on_error {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn finish_command(&self, inner: &mut WorkerInner, outcome: Result<()>) -> Result<()> {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        *self.last_activity.lock() = Instant::now();

        match outcome {
            Ok(()) => Ok(()),
            Err(e) => {
                // stop-on-error teardown
                self.stopped_on_error.store(true, Ordering::SeqCst);
                self.release_connection(inner).await;
                self.state.store(STATE_STOPPED, Ordering::SeqCst);
                self.cancel.cancel();
                warn!("Worker {} stopped on error: {}", self.key, e);
                Err(e)
            }
        }
    }

    async fn run_with_retries(
        &self,
        inner: &mut WorkerInner,
        cmd: &ReplayCommand,
        kind: CommandKind,
    ) -> Result<()> {
        let mut timeout_budget = self.settings.timeout_retries;
        let mut error_budget = self.settings.error_retries;

        loop {
            match self.attempt(inner, cmd, kind).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_timeout() && timeout_budget > 0 => {
                    timeout_budget -= 1;
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Command {} on {} timed out, retrying ({} attempts left)",
                        cmd.sequence, self.key, timeout_budget
                    );
                }
                Err(e) if !e.is_timeout() && error_budget > 0 => {
                    error_budget -= 1;
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Command {} on {} failed ({}), retrying ({} attempts left)",
                        cmd.sequence, self.key, e, error_budget
                    );
                    if e.is_connection_fault() {
                        // Reconnect fresh on the next attempt
                        self.release_connection(inner).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        inner: &mut WorkerInner,
        cmd: &ReplayCommand,
        kind: CommandKind,
    ) -> Result<()> {
        if inner.conn.is_none() {
            let conn = self.factory.connect(&self.conn_settings).await?;
            inner.conn = Some(conn);
            inner.current_database = self.conn_settings.database.clone();
            debug!("Opened replay connection for {}", self.key);
        }
        let conn = match inner.conn.as_deref() {
            Some(conn) => conn,
            None => {
                return Err(EngineError::ConnectionFault(
                    "connection unavailable".to_string(),
                ))
            }
        };

        let needs_db_context = matches!(
            kind,
            CommandKind::Query | CommandKind::Prepare { .. } | CommandKind::ExecuteHandle { .. }
        );
        if needs_db_context && !cmd.database.is_empty() && cmd.database != inner.current_database {
            self.timed(conn.change_database(&cmd.database)).await?;
            inner.current_database = cmd.database.clone();
        }

        match kind {
            CommandKind::Query => self.timed(conn.execute(&cmd.command_text)).await,
            CommandKind::ResetConnection { pooled } => self.timed(conn.reset(pooled)).await,
            CommandKind::Prepare { placeholder } => {
                let handle = self.timed(conn.prepare(&cmd.command_text)).await?;
                inner.handles.insert(placeholder, handle);
                Ok(())
            }
            CommandKind::ExecuteHandle { placeholder } => {
                match inner.handles.get(&placeholder).copied() {
                    Some(handle) => {
                        let text = substitute_handle(&cmd.command_text, handle);
                        self.timed(conn.execute(&text)).await
                    }
                    None => {
                        debug!(
                            "No live handle for placeholder {} on {}, dropping command {}",
                            placeholder, self.key, cmd.sequence
                        );
                        self.counters.unknown_handles.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                }
            }
            CommandKind::Unprepare { placeholder } => {
                match inner.handles.remove(&placeholder) {
                    Some(handle) => self.timed(conn.unprepare(handle)).await,
                    None => Ok(()),
                }
            }
        }
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.settings.command_timeout.is_zero() {
            return fut.await;
        }
        match tokio::time::timeout(self.settings.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::CommandTimeout(
                self.settings.command_timeout.as_millis() as u64,
            )),
        }
    }

    async fn surface_marker(&self, inner: &mut WorkerInner, cmd: &ReplayCommand, err: &EngineError) {
        let marker = format!(
            "-- replay error marker: sequence={} class={} message={}",
            cmd.sequence,
            err.class(),
            err
        );
        if let Some(conn) = inner.conn.as_deref() {
            if let Err(e) = conn.execute(&marker).await {
                debug!("Failed to surface error marker for {}: {}", self.key, e);
            }
        }
    }

    async fn release_connection(&self, inner: &mut WorkerInner) {
        if let Some(conn) = inner.conn.take() {
            if let Err(e) = conn.close().await {
                debug!("Error closing connection for {}: {}", self.key, e);
            }
            inner.handles.clear();
            debug!("Released connection for {}", self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::connection::SimulatedConnectionFactory;
    use crate::utils::config::SimulatedTargetConfig;

    fn test_key() -> SessionKey {
        SessionKey {
            session_id: 51,
            database: "app".to_string(),
            application: None,
        }
    }

    fn test_settings() -> WorkerSettings {
        WorkerSettings {
            command_timeout: Duration::from_millis(500),
            timeout_retries: 1,
            error_retries: 1,
            stop_on_error: false,
            surface_errors: false,
            delay_mode: DelayMode::Absolute,
            wait_strategy: WaitStrategy::default(),
        }
    }

    fn make_worker(
        profile: SimulatedTargetConfig,
        settings: WorkerSettings,
    ) -> (Arc<ReplayWorker>, Arc<SimulatedConnectionFactory>) {
        let factory = Arc::new(SimulatedConnectionFactory::new(profile));
        let conn_settings = ConnectionSettings {
            database: "app".to_string(),
            application_name: "parrot-replay".to_string(),
            login_name: "replay".to_string(),
            host_name: "replay-host".to_string(),
        };
        let cancel = CancellationToken::new();
        let worker = Arc::new(ReplayWorker::new(
            test_key(),
            conn_settings,
            Arc::clone(&factory) as Arc<dyn ConnectionFactory>,
            settings,
            &cancel,
        ));
        (worker, factory)
    }

    fn cmd(text: &str, offset_ms: u64, sequence: u64) -> ReplayCommand {
        ReplayCommand {
            command_text: text.to_string(),
            database: "app".to_string(),
            application_name: "parrot-replay".to_string(),
            replay_offset_ms: offset_ms,
            sequence,
            start_time: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_settings_carry_configured_skip_threshold() {
        let cfg = ReplayConfig {
            skip_threshold_ms: 1_500,
            warn_interval_ms: 5_000,
            ..ReplayConfig::default()
        };
        let settings = WorkerSettings::from_config(&cfg);
        assert_eq!(
            settings.wait_strategy.skip_threshold,
            Duration::from_millis(1_500)
        );
        assert_eq!(
            settings.wait_strategy.warn_interval,
            Duration::from_millis(5_000)
        );
    }

    #[tokio::test]
    async fn test_commands_execute_in_order() {
        let (worker, factory) = make_worker(SimulatedTargetConfig::default(), test_settings());

        for n in 0..5 {
            worker.append(cmd(&format!("select {}", n), 0, n));
        }
        worker.run().await.unwrap();

        let texts = factory.log().texts();
        assert_eq!(texts, vec!["select 0", "select 1", "select 2", "select 3", "select 4"]);
        assert_eq!(worker.pending(), 0);
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_prepared_handle_substitution() {
        let (worker, factory) = make_worker(SimulatedTargetConfig::default(), test_settings());

        worker.append(cmd("exec sp_prepare 2, N'select * from t where id = @p1'", 0, 1));
        worker.append(cmd("exec sp_execute 2, 42", 0, 2));
        worker.append(cmd("exec sp_unprepare 2", 0, 3));
        worker.run().await.unwrap();

        let texts = factory.log().texts();
        // The first live handle the simulated factory hands out is 1000
        assert_eq!(texts[1], "exec sp_execute 1000, 42");
        assert_eq!(worker.stats().executed, 3);
    }

    #[tokio::test]
    async fn test_unknown_handle_is_dropped() {
        let (worker, factory) = make_worker(SimulatedTargetConfig::default(), test_settings());

        worker.append(cmd("exec sp_execute 9, 1", 0, 1));
        worker.append(cmd("select after", 0, 2));
        worker.run().await.unwrap();

        assert_eq!(factory.log().texts(), vec!["select after"]);
        assert_eq!(worker.stats().unknown_handles, 1);
    }

    #[tokio::test]
    async fn test_reset_skips_following_delay() {
        let (worker, factory) = make_worker(SimulatedTargetConfig::default(), test_settings());

        worker.append(cmd("exec sp_reset_connection", 0, 1));
        worker.append(cmd("select far_future", 60_000, 2));

        let started = Instant::now();
        worker.run().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(factory.log().texts(), vec!["select far_future"]);
    }

    #[tokio::test]
    async fn test_failed_command_retries_then_abandons() {
        let profile = SimulatedTargetConfig {
            fail_matching: Some("poison".to_string()),
            ..SimulatedTargetConfig::default()
        };
        let (worker, factory) = make_worker(profile, test_settings());

        worker.append(cmd("select poison", 0, 1));
        worker.append(cmd("select survivor", 0, 2));
        worker.run().await.unwrap();

        assert_eq!(factory.log().texts(), vec!["select survivor"]);
        let stats = worker.stats();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.executed, 1);
    }

    #[tokio::test]
    async fn test_timeout_budget_consumed() {
        let profile = SimulatedTargetConfig {
            timeout_matching: Some("slow".to_string()),
            ..SimulatedTargetConfig::default()
        };
        let settings = WorkerSettings {
            command_timeout: Duration::from_millis(50),
            timeout_retries: 1,
            ..test_settings()
        };
        let (worker, factory) = make_worker(profile, settings);

        worker.append(cmd("select slow", 0, 1));
        let started = Instant::now();
        worker.run().await.unwrap();

        // Two attempts of 50ms each before abandoning
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(factory.log().is_empty());
        let stats = worker.stats();
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.abandoned, 1);
    }

    #[tokio::test]
    async fn test_stop_on_error_tears_down() {
        let profile = SimulatedTargetConfig {
            fail_matching: Some("poison".to_string()),
            ..SimulatedTargetConfig::default()
        };
        let settings = WorkerSettings {
            stop_on_error: true,
            error_retries: 0,
            ..test_settings()
        };
        let (worker, factory) = make_worker(profile, settings);

        worker.append(cmd("select fine", 0, 1));
        worker.append(cmd("select poison", 0, 2));
        worker.append(cmd("select never", 0, 3));

        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, EngineError::CommandFailed(_)));
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(factory.closes(), 1);

        // A stopped worker refuses further drains
        worker.append(cmd("select more", 0, 4));
        worker.run().await.unwrap();
        assert_eq!(factory.log().texts(), vec!["select fine"]);
    }

    #[tokio::test]
    async fn test_stop_releases_connection_exactly_once() {
        let (worker, factory) = make_worker(SimulatedTargetConfig::default(), test_settings());

        worker.append(cmd("select 1", 0, 1));
        worker.run().await.unwrap();
        assert_eq!(factory.connects(), 1);

        worker.stop().await;
        worker.stop().await;
        assert_eq!(factory.closes(), 1);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_surfaced_error_marker() {
        let profile = SimulatedTargetConfig {
            fail_matching: Some("poison".to_string()),
            ..SimulatedTargetConfig::default()
        };
        let settings = WorkerSettings {
            surface_errors: true,
            error_retries: 0,
            ..test_settings()
        };
        let (worker, factory) = make_worker(profile, settings);

        worker.append(cmd("select poison", 0, 7));
        worker.run().await.unwrap();

        let texts = factory.log().texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("replay error marker"));
        assert!(texts[0].contains("sequence=7"));
    }

    #[tokio::test]
    async fn test_database_context_switch() {
        let (worker, factory) = make_worker(SimulatedTargetConfig::default(), test_settings());

        let mut other = cmd("select elsewhere", 0, 1);
        other.database = "reporting".to_string();
        worker.append(cmd("select home", 0, 1));
        worker.append(other);
        worker.run().await.unwrap();

        assert_eq!(factory.log().texts_for_database("app"), vec!["select home"]);
        assert_eq!(
            factory.log().texts_for_database("reporting"),
            vec!["select elsewhere"]
        );
    }
}
