// src/replay/command.rs
//! Replay command projection
//!
//! Execution events are projected into the minimal payload a worker needs,
//! and their text is classified into the special procedure forms that drive
//! the prepared-statement lifecycle and connection resets.

use crate::events::event::ExecutionEvent;
use chrono::{DateTime, Utc};

/// A command queued for replay on one session worker
#[derive(Debug, Clone)]
pub struct ReplayCommand {
    /// Command text to execute
    pub command_text: String,

    /// Replay-side database (capture name after remapping)
    pub database: String,

    /// Client application name from the capture
    pub application_name: String,

    /// Offset from workload start at which the command ran
    pub replay_offset_ms: u64,

    /// Global capture sequence number
    pub sequence: u64,

    /// Capture-side start timestamp
    pub start_time: DateTime<Utc>,
}

impl ReplayCommand {
    /// Project an execution event, with the database already remapped
    pub fn from_event(event: &ExecutionEvent, database: String) -> Self {
        Self {
            command_text: event.command_text.clone(),
            database,
            application_name: event.application_name.clone(),
            replay_offset_ms: event.replay_offset_ms,
            sequence: event.sequence,
            start_time: event.start_time,
        }
    }

    /// Classify this command's text
    pub fn kind(&self) -> CommandKind {
        classify(&self.command_text)
    }
}

/// Structural classification of a command's text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Plain statement, executed as-is
    Query,

    /// Connection reset; the following command skips its replay delay
    ResetConnection { pooled: bool },

    /// Statement preparation; the placeholder is the capture-side handle
    Prepare { placeholder: i64 },

    /// Execution of a previously prepared statement
    ExecuteHandle { placeholder: i64 },

    /// Release of a previously prepared statement
    Unprepare { placeholder: i64 },
}

/// Classify command text into its structural kind
///
/// Recognizes `sp_reset_connection`, `sp_prepare`, `sp_execute`, and
/// `sp_unprepare`, with an optional leading `exec`/`execute`. The first
/// integer argument is the capture-side placeholder. Anything else,
/// including `sp_executesql`, is a plain query.
pub fn classify(text: &str) -> CommandKind {
    let body = strip_exec_prefix(text.trim_start());
    let (proc_name, args) = body.split_at(token_end(body));

    if proc_name.eq_ignore_ascii_case("sp_reset_connection") {
        return CommandKind::ResetConnection { pooled: true };
    }

    let placeholder = leading_integer(args);
    if proc_name.eq_ignore_ascii_case("sp_prepare") {
        if let Some(placeholder) = placeholder {
            return CommandKind::Prepare { placeholder };
        }
    } else if proc_name.eq_ignore_ascii_case("sp_execute") {
        if let Some(placeholder) = placeholder {
            return CommandKind::ExecuteHandle { placeholder };
        }
    } else if proc_name.eq_ignore_ascii_case("sp_unprepare") {
        if let Some(placeholder) = placeholder {
            return CommandKind::Unprepare { placeholder };
        }
    }

    CommandKind::Query
}

/// Rewrite the placeholder in an `sp_execute` text to the live handle
///
/// Replaces the first integer after the procedure name; the text is returned
/// unchanged when no integer is present.
pub fn substitute_handle(text: &str, handle: i64) -> String {
    let trim_off = text.len() - text.trim_start().len();
    let mut cursor = trim_off;

    let first = &text[cursor..];
    let first_end = token_end(first);
    let token = &first[..first_end];
    if token.eq_ignore_ascii_case("exec") || token.eq_ignore_ascii_case("execute") {
        cursor += first_end;
        let rest = &text[cursor..];
        cursor += rest.len() - rest.trim_start().len();
    }

    // Skip the procedure name itself
    cursor += token_end(&text[cursor..]);

    let rest = &text[cursor..];
    let digit_start = match rest.find(|c: char| c.is_ascii_digit()) {
        Some(i) => cursor + i,
        None => return text.to_string(),
    };
    let digit_len = text[digit_start..]
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len() - digit_start);

    format!(
        "{}{}{}",
        &text[..digit_start],
        handle,
        &text[digit_start + digit_len..]
    )
}

fn strip_exec_prefix(s: &str) -> &str {
    let end = token_end(s);
    let (token, rest) = s.split_at(end);
    if token.eq_ignore_ascii_case("exec") || token.eq_ignore_ascii_case("execute") {
        rest.trim_start()
    } else {
        s
    }
}

fn token_end(s: &str) -> usize {
    s.find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(s.len())
}

fn leading_integer(args: &str) -> Option<i64> {
    let rest = args.trim_start_matches(|c: char| c.is_whitespace() || c == ',' || c == '=');
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    rest[..end].parse().ok()
}
