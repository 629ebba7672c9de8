// src/events/event.rs
//! Workload event model
//!
//! Captured database activity normalized into one tagged union so the queue,
//! consumers, and the replay path all move a single payload type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One captured workload event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkloadEvent {
    /// A command executed by a client session
    Execution(ExecutionEvent),

    /// An informational server message
    Message(MessageEvent),

    /// A server-side error observed during capture
    Error(ErrorEvent),

    /// A client command that timed out during capture
    Timeout(TimeoutEvent),

    /// A batch of sampled performance counters
    Counter(CounterEvent),

    /// A batch of sampled wait statistics
    WaitStats(WaitStatsEvent),
}

impl WorkloadEvent {
    /// Event discriminant for routing and aggregation
    pub fn kind(&self) -> EventKind {
        match self {
            WorkloadEvent::Execution(_) => EventKind::Execution,
            WorkloadEvent::Message(_) => EventKind::Message,
            WorkloadEvent::Error(_) => EventKind::Error,
            WorkloadEvent::Timeout(_) => EventKind::Timeout,
            WorkloadEvent::Counter(_) => EventKind::Counter,
            WorkloadEvent::WaitStats(_) => EventKind::WaitStats,
        }
    }

    /// Capture-side timestamp of the event
    pub fn start_time(&self) -> DateTime<Utc> {
        match self {
            WorkloadEvent::Execution(e) => e.start_time,
            WorkloadEvent::Message(e) => e.start_time,
            WorkloadEvent::Error(e) => e.start_time,
            WorkloadEvent::Timeout(e) => e.start_time,
            WorkloadEvent::Counter(e) => e.start_time,
            WorkloadEvent::WaitStats(e) => e.start_time,
        }
    }
}

/// Event discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Execution,
    Message,
    Error,
    Timeout,
    Counter,
    WaitStats,
}

impl EventKind {
    /// Stable label used in summaries and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Execution => "execution",
            EventKind::Message => "message",
            EventKind::Error => "error",
            EventKind::Timeout => "timeout",
            EventKind::Counter => "counter",
            EventKind::WaitStats => "wait_stats",
        }
    }
}

/// A command executed by a client session during capture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Command text as captured
    pub command_text: String,

    /// Capture-side session identifier
    pub session_id: u64,

    /// Client application name
    pub application_name: String,

    /// Database the session was using
    pub database_name: String,

    /// Login the session authenticated as
    pub login_name: String,

    /// Host the session connected from
    pub host_name: String,

    /// Logical reads performed
    pub reads: i64,

    /// Logical writes performed
    pub writes: i64,

    /// CPU time consumed, in milliseconds
    pub cpu_ms: i64,

    /// Wall-clock duration, in milliseconds
    pub duration_ms: i64,

    /// Global capture sequence number
    pub sequence: u64,

    /// Offset from workload start at which the command began
    pub replay_offset_ms: u64,

    /// Capture-side start timestamp
    pub start_time: DateTime<Utc>,
}

impl ExecutionEvent {
    /// Create an execution event with neutral defaults
    pub fn new(session_id: u64, command_text: impl Into<String>) -> Self {
        Self {
            command_text: command_text.into(),
            session_id,
            application_name: String::new(),
            database_name: String::new(),
            login_name: String::new(),
            host_name: String::new(),
            reads: 0,
            writes: 0,
            cpu_ms: 0,
            duration_ms: 0,
            sequence: 0,
            replay_offset_ms: 0,
            start_time: Utc::now(),
        }
    }

    /// Set the replay offset from workload start
    pub fn with_offset_ms(mut self, offset_ms: u64) -> Self {
        self.replay_offset_ms = offset_ms;
        self
    }

    /// Set the originating database
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database_name = database.into();
        self
    }

    /// Set the client application name
    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application_name = application.into();
        self
    }

    /// Set the global capture sequence number
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

/// Informational server message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Message text
    pub text: String,

    /// Capture-side timestamp
    pub start_time: DateTime<Utc>,
}

/// Server-side error observed during capture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Session that hit the error, when known
    pub session_id: Option<u64>,

    /// Error text
    pub message: String,

    /// Capture-side timestamp
    pub start_time: DateTime<Utc>,
}

/// Command timeout observed during capture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutEvent {
    /// Session whose command timed out
    pub session_id: u64,

    /// The command that timed out
    pub command_text: String,

    /// How long the command ran before the timeout fired
    pub duration_ms: u64,

    /// Capture-side timestamp
    pub start_time: DateTime<Utc>,
}

/// Sampled performance counter batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterEvent {
    /// Counter name to value
    pub counters: HashMap<String, f64>,

    /// Sample timestamp
    pub start_time: DateTime<Utc>,
}

/// Sampled wait statistics batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitStatsEvent {
    /// Per-wait-type samples
    pub waits: Vec<WaitSample>,

    /// Sample timestamp
    pub start_time: DateTime<Utc>,
}

/// One wait-type sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitSample {
    /// Wait type name
    pub wait_type: String,

    /// Accumulated wait time in milliseconds
    pub wait_ms: u64,

    /// Number of waits observed
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let event = ExecutionEvent::new(51, "select 1")
            .with_offset_ms(250)
            .with_database("orders")
            .with_application("billing")
            .with_sequence(9);

        assert_eq!(event.session_id, 51);
        assert_eq!(event.replay_offset_ms, 250);
        assert_eq!(event.database_name, "orders");
        assert_eq!(event.application_name, "billing");
        assert_eq!(event.sequence, 9);
    }

    #[test]
    fn test_kind_labels() {
        let exec = WorkloadEvent::Execution(ExecutionEvent::new(1, "select 1"));
        assert_eq!(exec.kind(), EventKind::Execution);
        assert_eq!(exec.kind().as_str(), "execution");

        let msg = WorkloadEvent::Message(MessageEvent {
            text: "recovery complete".to_string(),
            start_time: Utc::now(),
        });
        assert_eq!(msg.kind().as_str(), "message");

        let sample = WorkloadEvent::Counter(CounterEvent {
            counters: HashMap::new(),
            start_time: Utc::now(),
        });
        assert_eq!(sample.kind(), EventKind::Counter);
        let json = serde_json::to_string(&sample).unwrap();
        assert!(json.contains("\"type\":\"counter\""));
    }

    #[test]
    fn test_serde_round_trip() {
        let event = WorkloadEvent::Execution(
            ExecutionEvent::new(7, "exec sp_execute 3").with_offset_ms(100),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"execution\""));

        let back: WorkloadEvent = serde_json::from_str(&json).unwrap();
        match back {
            WorkloadEvent::Execution(e) => {
                assert_eq!(e.session_id, 7);
                assert_eq!(e.replay_offset_ms, 100);
            }
            other => panic!("wrong variant: {:?}", other.kind()),
        }
    }
}
