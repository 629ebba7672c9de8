// src/replay/timing.rs
//! Replay delay timing
//!
//! Reproduces capture-side pacing: each command waits until its offset from
//! workload start (absolute mode) or until the captured gap since the
//! previous command has passed (relative mode). Waits are tiered to stay
//! cheap when far from the deadline and precise near it: one coarse sleep,
//! then 5ms naps, then a yield loop for the final stretch.

use metrics::{counter, histogram};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How command delays are derived from capture offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayMode {
    /// Time every command against session replay start
    Absolute,

    /// Time every command against the previous command's offset
    Relative,
}

/// Tunable wait behavior
#[derive(Debug, Clone)]
pub struct WaitStrategy {
    /// Above this remaining time, one coarse sleep covers most of the delay
    pub coarse_floor: Duration,

    /// Nap length used between the coarse sleep and the spin window
    pub fine_step: Duration,

    /// Remaining time handled by the yield loop
    pub spin_window: Duration,

    /// Behind-schedule distance beyond which delays are skipped outright
    pub skip_threshold: Duration,

    /// Minimum spacing between behind-schedule warnings
    pub warn_interval: Duration,
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self {
            coarse_floor: Duration::from_millis(50),
            fine_step: Duration::from_millis(5),
            spin_window: Duration::from_millis(5),
            skip_threshold: Duration::from_secs(10),
            warn_interval: Duration::from_secs(30),
        }
    }
}

/// Decision for one command's delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPlan {
    /// Wait this long before executing
    Sleep(Duration),

    /// Deadline already passed within tolerance; execute now
    Immediate,

    /// Replay is hopelessly behind; skip the delay and note it
    FallingBehind(Duration),
}

/// Pure delay arithmetic shared by both modes
pub fn plan_wait(target_ms: u64, elapsed: Duration, skip_threshold: Duration) -> WaitPlan {
    let target = Duration::from_millis(target_ms);
    match target.checked_sub(elapsed) {
        Some(delay) if !delay.is_zero() => WaitPlan::Sleep(delay),
        Some(_) => WaitPlan::Immediate,
        None => {
            let behind = elapsed - target;
            if behind > skip_threshold {
                WaitPlan::FallingBehind(behind)
            } else {
                WaitPlan::Immediate
            }
        }
    }
}

/// Result of one delay
#[derive(Debug, Clone, Copy)]
pub struct WaitOutcome {
    /// Delay the schedule called for
    pub requested: Duration,

    /// Time actually spent waiting
    pub actual: Duration,

    /// The delay was skipped because replay fell too far behind
    pub skipped: bool,
}

impl WaitOutcome {
    fn none(skipped: bool) -> Self {
        Self {
            requested: Duration::ZERO,
            actual: Duration::ZERO,
            skipped,
        }
    }
}

/// Per-session delay state
pub struct DelayTimer {
    mode: DelayMode,
    strategy: WaitStrategy,
    origin: Instant,
    prev_offset_ms: u64,
    prev_mark: Instant,
    skips_since_warn: u64,
    last_warn: Option<Instant>,
}

impl DelayTimer {
    /// Start a timer; the session's replay clock begins now
    pub fn new(mode: DelayMode, strategy: WaitStrategy) -> Self {
        let now = Instant::now();
        Self {
            mode,
            strategy,
            origin: now,
            prev_offset_ms: 0,
            prev_mark: now,
            skips_since_warn: 0,
            last_warn: None,
        }
    }

    /// Wait until the command at `offset_ms` is due
    pub async fn wait_for(&mut self, offset_ms: u64, cancel: &CancellationToken) -> WaitOutcome {
        let (target_ms, elapsed) = match self.mode {
            DelayMode::Absolute => (offset_ms, self.origin.elapsed()),
            DelayMode::Relative => (
                offset_ms.saturating_sub(self.prev_offset_ms),
                self.prev_mark.elapsed(),
            ),
        };

        let outcome = match plan_wait(target_ms, elapsed, self.strategy.skip_threshold) {
            WaitPlan::Sleep(delay) => {
                let started = Instant::now();
                self.sleep_tiered(delay, cancel).await;
                WaitOutcome {
                    requested: delay,
                    actual: started.elapsed(),
                    skipped: false,
                }
            }
            WaitPlan::Immediate => WaitOutcome::none(false),
            WaitPlan::FallingBehind(behind) => {
                self.note_behind(behind);
                WaitOutcome::none(true)
            }
        };

        self.mark(offset_ms);
        let drift_ms =
            (outcome.actual.as_secs_f64() - outcome.requested.as_secs_f64()) * 1000.0;
        histogram!("parrot_replay_wait_drift_ms").record(drift_ms);
        outcome
    }

    /// Advance the timing baseline without waiting
    ///
    /// Used when a command's delay is skipped after a connection reset.
    pub fn mark(&mut self, offset_ms: u64) {
        self.prev_offset_ms = offset_ms;
        self.prev_mark = Instant::now();
    }

    async fn sleep_tiered(&self, delay: Duration, cancel: &CancellationToken) {
        let deadline = Instant::now() + delay;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(r) => r,
                None => return,
            };
            if remaining <= self.strategy.spin_window {
                break;
            }
            let nap = if remaining > self.strategy.coarse_floor {
                remaining - self.strategy.coarse_floor
            } else {
                self.strategy.fine_step
            };
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = cancel.cancelled() => return,
            }
        }

        // Final stretch: stay on-core, but keep yielding to the runtime
        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                return;
            }
            tokio::task::yield_now().await;
            std::hint::spin_loop();
        }
    }

    fn note_behind(&mut self, behind: Duration) {
        self.skips_since_warn += 1;
        counter!("parrot_replay_delays_skipped_total").increment(1);

        let now = Instant::now();
        let due = self
            .last_warn
            .map_or(true, |t| now.duration_since(t) >= self.strategy.warn_interval);
        if due {
            warn!(
                "Replay fell {:.1}s behind schedule; skipped {} delays since last report",
                behind.as_secs_f64(),
                self.skips_since_warn
            );
            self.last_warn = Some(now);
            self.skips_since_warn = 0;
        }
    }
}
