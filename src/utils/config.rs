// src/utils/config.rs
//! Engine configuration
//!
//! Loads layered configuration from an optional `parrot` config file plus
//! `PARROT__*` environment variables, validated fail-fast before any
//! component starts.

use crate::queue::segment::CompressionLevel;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Worker scheduling strategy for replay dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplayStrategy {
    /// Long-lived drain task per worker, restarted on demand
    WorkerTask,

    /// Semaphore-gated drain task per dispatch
    TaskPool,

    /// Semaphore-gated task per command
    TaskPerCommand,

    /// Commands execute inline on the dispatching task
    Serial,
}

impl Default for ReplayStrategy {
    fn default() -> Self {
        ReplayStrategy::WorkerTask
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Event source selection
    pub source: SourceConfig,

    /// Replay target selection
    pub target: TargetConfig,

    /// Hybrid queue tuning
    pub queue: QueueConfig,

    /// Replay worker behavior
    pub replay: ReplayConfig,

    /// Controller loop behavior
    pub controller: ControllerConfig,
}

/// Event source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Source kind: currently `synthetic`
    pub kind: String,

    /// Settings for the synthetic source
    pub synthetic: SyntheticConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: "synthetic".to_string(),
            synthetic: SyntheticConfig::default(),
        }
    }
}

/// Synthetic workload generator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Number of interleaved sessions to simulate
    pub sessions: u64,

    /// Commands generated per session
    pub commands_per_session: u32,

    /// Nominal spacing between consecutive commands of one session
    pub command_spacing_ms: u64,

    /// RNG seed for reproducible runs
    pub seed: u64,

    /// Databases assigned round-robin to sessions
    pub databases: Vec<String>,

    /// Emit message/counter noise events alongside executions
    pub include_noise: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            sessions: 8,
            commands_per_session: 50,
            command_spacing_ms: 20,
            seed: 42,
            databases: vec!["app".to_string()],
            include_noise: true,
        }
    }
}

/// Replay target configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Target adapter: currently `simulated`
    pub adapter: String,

    /// Settings for the simulated target
    pub simulated: SimulatedTargetConfig,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            adapter: "simulated".to_string(),
            simulated: SimulatedTargetConfig::default(),
        }
    }
}

/// Simulated target behavior
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedTargetConfig {
    /// Artificial per-command latency in milliseconds
    pub latency_ms: u64,

    /// Commands containing this substring fail with a command error
    pub fail_matching: Option<String>,

    /// Commands containing this substring hang until the command timeout
    pub timeout_matching: Option<String>,
}

/// Hybrid event queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// In-memory ring capacity; overflow chunk size is half of this
    pub buffer_size: usize,

    /// Directory that holds per-queue overflow working directories
    pub spill_dir: PathBuf,

    /// Compression level for overflow segments
    pub compression: CompressionLevel,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            buffer_size: 10_000,
            spill_dir: std::env::temp_dir().join("parrot-spill"),
            compression: CompressionLevel::Fast,
        }
    }
}

/// Replay worker and registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Worker scheduling strategy
    pub strategy: ReplayStrategy,

    /// Global cap on concurrently executing replay tasks
    pub max_concurrency: usize,

    /// Per-command execution timeout (0 disables the timeout)
    pub command_timeout_ms: u64,

    /// Retry budget for timed-out commands
    pub timeout_retries: u32,

    /// Retry budget for failed commands
    pub error_retries: u32,

    /// Evict workers idle for longer than this
    pub idle_timeout_ms: u64,

    /// How often the idle sweeper scans the registry
    pub sweep_interval_ms: u64,

    /// Time each command against the previous command instead of session start
    pub relative_delays: bool,

    /// Behind-schedule distance beyond which delays are skipped, in milliseconds
    pub skip_threshold_ms: u64,

    /// Minimum spacing between behind-schedule warnings, in milliseconds
    pub warn_interval_ms: u64,

    /// Present the captured application name on replay connections
    pub mimic_application_name: bool,

    /// Remap captured database names to replay-side names
    pub database_map: HashMap<String, String>,

    /// Abort the worker on the first exhausted retry budget
    pub stop_on_error: bool,

    /// Surface exhausted failures as marker statements on the target
    pub surface_errors: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            strategy: ReplayStrategy::default(),
            max_concurrency: 256,
            command_timeout_ms: 30_000,
            timeout_retries: 2,
            error_retries: 2,
            idle_timeout_ms: 300_000,
            sweep_interval_ms: 30_000,
            relative_delays: false,
            skip_threshold_ms: 10_000,
            warn_interval_ms: 30_000,
            mimic_application_name: false,
            database_map: HashMap::new(),
            stop_on_error: false,
            surface_errors: false,
        }
    }
}

/// Controller loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Sleep between polls when the source has nothing to offer
    pub poll_interval_ms: u64,

    /// Grace period for consumers to drain after the source ends
    pub shutdown_grace_ms: u64,

    /// Attach the workload summary consumer
    pub enable_summary: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 25,
            shutdown_grace_ms: 30_000,
            enable_summary: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `parrot.{toml,yaml,json}` (if present) plus
    /// `PARROT__*` environment variables
    pub fn load() -> Result<Self> {
        Self::load_from("parrot")
    }

    /// Load configuration from an explicit file path plus environment overrides
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("PARROT").separator("__"))
            .build()
            .map_err(|e| EngineError::ConfigError(format!("Failed to load config: {}", e)))?;

        let cfg: EngineConfig = settings
            .try_deserialize()
            .map_err(|e| EngineError::ConfigError(format!("Invalid config: {}", e)))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate cross-field invariants; all violations fail fast
    pub fn validate(&self) -> Result<()> {
        if self.queue.buffer_size < 2 {
            return Err(EngineError::ConfigError(format!(
                "queue.buffer_size must be at least 2, got {}",
                self.queue.buffer_size
            )));
        }
        if self.replay.max_concurrency == 0 {
            return Err(EngineError::ConfigError(
                "replay.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.replay.idle_timeout_ms == 0 || self.replay.sweep_interval_ms == 0 {
            return Err(EngineError::ConfigError(
                "replay idle_timeout_ms and sweep_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.replay.skip_threshold_ms == 0 || self.replay.warn_interval_ms == 0 {
            return Err(EngineError::ConfigError(
                "replay skip_threshold_ms and warn_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.controller.poll_interval_ms == 0 {
            return Err(EngineError::ConfigError(
                "controller.poll_interval_ms must be non-zero".to_string(),
            ));
        }
        match self.source.kind.as_str() {
            "synthetic" => {}
            other => {
                return Err(EngineError::ConfigError(format!(
                    "Unknown source kind: {}",
                    other
                )));
            }
        }
        match self.target.adapter.as_str() {
            "simulated" => {}
            other => {
                return Err(EngineError::ConfigError(format!(
                    "Unknown target adapter: {}",
                    other
                )));
            }
        }
        if self.source.synthetic.sessions == 0 {
            return Err(EngineError::ConfigError(
                "source.synthetic.sessions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
