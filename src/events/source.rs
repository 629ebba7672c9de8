// src/events/source.rs
//! Event sources
//!
//! An `EventSource` feeds the controller one captured event at a time. The
//! synthetic source generates a deterministic interleaved workload for
//! development runs and benchmarks.

use crate::events::event::{
    CounterEvent, ExecutionEvent, MessageEvent, WorkloadEvent,
};
use crate::utils::config::{SourceConfig, SyntheticConfig};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

/// A stream of captured workload events
#[async_trait]
pub trait EventSource: Send {
    /// Pull the next event; `Ok(None)` means nothing available right now
    async fn read(&mut self) -> Result<Option<WorkloadEvent>>;

    /// Whether the source may still produce events
    ///
    /// End of stream is `read` returning `Ok(None)` while this is `false`.
    fn is_running(&self) -> bool;
}

/// Build the configured event source
pub fn build_source(cfg: &SourceConfig) -> Result<Box<dyn EventSource>> {
    match cfg.kind.as_str() {
        "synthetic" => Ok(Box::new(SyntheticSource::new(cfg.synthetic.clone()))),
        other => Err(EngineError::ConfigError(format!(
            "Unknown source kind: {}",
            other
        ))),
    }
}

/// Deterministic generated workload
///
/// Sessions are interleaved round-robin with staggered offsets. Each session
/// mixes plain queries, prepare/execute/unprepare blocks, and connection
/// resets; optional counter and message noise rides alongside.
pub struct SyntheticSource {
    events: VecDeque<WorkloadEvent>,
}

impl SyntheticSource {
    /// Generate the full workload up front from the seeded RNG
    pub fn new(cfg: SyntheticConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut events = VecDeque::new();
        let mut sequence: u64 = 0;
        let start = Utc::now();
        let sessions = cfg.sessions.max(1);

        // Tracks the open prepared-statement placeholder per session
        let mut open_handles: Vec<Option<i64>> = vec![None; sessions as usize];
        let mut next_placeholder: Vec<i64> = vec![1; sessions as usize];

        for round in 0..cfg.commands_per_session as u64 {
            for slot in 0..sessions {
                let session_id = 50 + slot;
                let database = if cfg.databases.is_empty() {
                    "app".to_string()
                } else {
                    cfg.databases[(slot as usize) % cfg.databases.len()].clone()
                };
                let stagger = (cfg.command_spacing_ms * slot) / sessions;
                let offset_ms = round * cfg.command_spacing_ms + stagger;

                let text = Self::next_command(
                    &mut rng,
                    slot as usize,
                    &mut open_handles,
                    &mut next_placeholder,
                );

                sequence += 1;
                let event = ExecutionEvent {
                    command_text: text,
                    session_id,
                    application_name: format!("synthetic-client-{}", slot % 3),
                    database_name: database,
                    login_name: "workload".to_string(),
                    host_name: "capture-host".to_string(),
                    reads: rng.gen_range(0..2_000),
                    writes: rng.gen_range(0..50),
                    cpu_ms: rng.gen_range(0..40),
                    duration_ms: rng.gen_range(0..120),
                    sequence,
                    replay_offset_ms: offset_ms,
                    start_time: start,
                };
                events.push_back(WorkloadEvent::Execution(event));

                if cfg.include_noise && rng.gen_ratio(1, 40) {
                    events.push_back(WorkloadEvent::Message(MessageEvent {
                        text: format!("checkpoint completed on round {}", round),
                        start_time: start,
                    }));
                }
            }

            if cfg.include_noise && round % 16 == 15 {
                let mut counters = std::collections::HashMap::new();
                counters.insert("batch_requests_per_sec".to_string(), rng.gen_range(10.0..900.0));
                counters.insert("page_life_expectancy".to_string(), rng.gen_range(300.0..9000.0));
                events.push_back(WorkloadEvent::Counter(CounterEvent {
                    counters,
                    start_time: start,
                }));
            }
        }

        Self { events }
    }

    fn next_command(
        rng: &mut StdRng,
        slot: usize,
        open_handles: &mut [Option<i64>],
        next_placeholder: &mut [i64],
    ) -> String {
        // Close an open prepared statement before anything else occasionally
        if let Some(placeholder) = open_handles[slot] {
            if rng.gen_ratio(1, 4) {
                open_handles[slot] = None;
                return format!("exec sp_unprepare {}", placeholder);
            }
            if rng.gen_ratio(2, 3) {
                return format!(
                    "exec sp_execute {}, {}",
                    placeholder,
                    rng.gen_range(1..100_000)
                );
            }
        }

        match rng.gen_range(0..10) {
            0 => {
                let placeholder = next_placeholder[slot];
                next_placeholder[slot] += 1;
                open_handles[slot] = Some(placeholder);
                format!(
                    "exec sp_prepare {}, N'select id, total from orders where id = @p1'",
                    placeholder
                )
            }
            1 => "exec sp_reset_connection".to_string(),
            2 => format!(
                "update orders set total = total + {} where id = {}",
                rng.gen_range(1..50),
                rng.gen_range(1..100_000)
            ),
            3 => format!(
                "insert into audit_log (actor, action) values ('user{}', 'login')",
                rng.gen_range(1..500)
            ),
            _ => format!(
                "select id, status, total from orders where customer_id = {}",
                rng.gen_range(1..10_000)
            ),
        }
    }

    /// Events remaining to be read
    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}

#[async_trait]
impl EventSource for SyntheticSource {
    async fn read(&mut self) -> Result<Option<WorkloadEvent>> {
        Ok(self.events.pop_front())
    }

    fn is_running(&self) -> bool {
        !self.events.is_empty()
    }
}
