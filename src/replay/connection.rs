// src/replay/connection.rs
//! Replay target connections
//!
//! Workers talk to the target through the `ReplayConnection` trait; a
//! `ConnectionFactory` opens connections on demand. The simulated adapter
//! stands in for a real server: it records every executed statement into a
//! shared log and can inject latency, failures, and hangs per configuration.

use crate::utils::config::{SimulatedTargetConfig, TargetConfig};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identity a replay connection presents to the target
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Initial database context
    pub database: String,

    /// Application name shown to the target
    pub application_name: String,

    /// Login name from the capture
    pub login_name: String,

    /// Host name from the capture
    pub host_name: String,
}

/// One live connection to the replay target
#[async_trait]
pub trait ReplayConnection: Send + Sync {
    /// Execute a statement in the current database context
    async fn execute(&self, command: &str) -> Result<()>;

    /// Switch the connection's database context
    async fn change_database(&self, database: &str) -> Result<()>;

    /// Prepare a statement, returning the live server-side handle
    async fn prepare(&self, command: &str) -> Result<i64>;

    /// Release a prepared statement
    async fn unprepare(&self, handle: i64) -> Result<()>;

    /// Reset session state, keeping or discarding the pooled connection
    async fn reset(&self, pooled: bool) -> Result<()>;

    /// Close the connection; safe to call more than once
    async fn close(&self) -> Result<()>;
}

/// Opens replay connections on demand
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a connection presenting the given identity
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Box<dyn ReplayConnection>>;
}

/// Build the configured connection factory
pub fn build_factory(cfg: &TargetConfig) -> Result<Arc<SimulatedConnectionFactory>> {
    match cfg.adapter.as_str() {
        "simulated" => Ok(Arc::new(SimulatedConnectionFactory::new(
            cfg.simulated.clone(),
        ))),
        other => Err(EngineError::ConfigError(format!(
            "Unknown target adapter: {}",
            other
        ))),
    }
}

/// One statement observed by the simulated target
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Database context at execution time
    pub database: String,

    /// Application name of the executing connection
    pub application: String,

    /// Statement text as received
    pub command_text: String,

    /// When the statement arrived
    pub at: Instant,
}

/// Shared record of everything the simulated target executed
#[derive(Default)]
pub struct ExecutionLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl ExecutionLog {
    fn record(&self, database: &str, application: &str, command_text: &str) {
        self.entries.lock().push(LogEntry {
            database: database.to_string(),
            application: application.to_string(),
            command_text: command_text.to_string(),
            at: Instant::now(),
        });
    }

    /// Snapshot all entries in arrival order
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Statement texts in arrival order
    pub fn texts(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|e| e.command_text.clone())
            .collect()
    }

    /// Statement texts executed against one database
    pub fn texts_for_database(&self, database: &str) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.database == database)
            .map(|e| e.command_text.clone())
            .collect()
    }

    /// Number of statements observed
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has executed yet
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Factory for simulated connections
pub struct SimulatedConnectionFactory {
    profile: SimulatedTargetConfig,
    log: Arc<ExecutionLog>,
    next_handle: Arc<AtomicI64>,
    connects: AtomicU64,
    closes: Arc<AtomicU64>,
}

impl SimulatedConnectionFactory {
    /// Create a factory with a fresh shared execution log
    pub fn new(profile: SimulatedTargetConfig) -> Self {
        Self {
            profile,
            log: Arc::new(ExecutionLog::default()),
            next_handle: Arc::new(AtomicI64::new(1000)),
            connects: AtomicU64::new(0),
            closes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The log shared by every connection from this factory
    pub fn log(&self) -> Arc<ExecutionLog> {
        Arc::clone(&self.log)
    }

    /// Connections opened so far
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Connections closed so far
    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ConnectionFactory for SimulatedConnectionFactory {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Box<dyn ReplayConnection>> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(SimulatedConnection {
            profile: self.profile.clone(),
            log: Arc::clone(&self.log),
            next_handle: Arc::clone(&self.next_handle),
            closes: Arc::clone(&self.closes),
            application_name: settings.application_name.clone(),
            current_database: Mutex::new(settings.database.clone()),
            prepared: Mutex::new(HashSet::new()),
            resets: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }))
    }
}

/// In-process stand-in for a real target connection
pub struct SimulatedConnection {
    profile: SimulatedTargetConfig,
    log: Arc<ExecutionLog>,
    next_handle: Arc<AtomicI64>,
    closes: Arc<AtomicU64>,
    application_name: String,
    current_database: Mutex<String>,
    prepared: Mutex<HashSet<i64>>,
    resets: AtomicU64,
    closed: AtomicBool,
}

impl SimulatedConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::ConnectionFault(
                "connection is closed".to_string(),
            ));
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        if self.profile.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.profile.latency_ms)).await;
        }
    }

    /// Session resets performed on this connection
    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ReplayConnection for SimulatedConnection {
    async fn execute(&self, command: &str) -> Result<()> {
        self.ensure_open()?;
        self.simulate_latency().await;

        if let Some(pattern) = &self.profile.timeout_matching {
            if command.contains(pattern.as_str()) {
                // Hang until the caller's timeout gives up on us
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
        if let Some(pattern) = &self.profile.fail_matching {
            if command.contains(pattern.as_str()) {
                return Err(EngineError::CommandFailed(format!(
                    "simulated failure for statement: {}",
                    command
                )));
            }
        }

        let database = self.current_database.lock().clone();
        self.log.record(&database, &self.application_name, command);
        Ok(())
    }

    async fn change_database(&self, database: &str) -> Result<()> {
        self.ensure_open()?;
        *self.current_database.lock() = database.to_string();
        Ok(())
    }

    async fn prepare(&self, command: &str) -> Result<i64> {
        self.execute(command).await?;
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.prepared.lock().insert(handle);
        Ok(handle)
    }

    async fn unprepare(&self, handle: i64) -> Result<()> {
        self.ensure_open()?;
        if !self.prepared.lock().remove(&handle) {
            return Err(EngineError::CommandFailed(format!(
                "unknown prepared handle {}",
                handle
            )));
        }
        Ok(())
    }

    async fn reset(&self, _pooled: bool) -> Result<()> {
        self.ensure_open()?;
        self.resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
