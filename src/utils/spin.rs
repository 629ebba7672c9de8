// src/utils/spin.rs
//! Bounded-backoff waiting
//!
//! Producers that hit worker backpressure park here instead of sleeping a
//! fixed interval: a short spin phase, then cooperative yields, then short
//! jittered sleeps capped at a few milliseconds.

use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SPIN_STEPS: u32 = 6;
const YIELD_STEPS: u32 = 12;
const MAX_SLEEP_MS: u64 = 4;

/// Escalating backoff state for one wait site
pub struct Backoff {
    step: u32,
}

impl Backoff {
    /// Create a backoff at the cheapest step
    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// Reset after the awaited condition was observed
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Wait one step, escalating spin -> yield -> jittered sleep
    pub async fn snooze(&mut self) {
        if self.step < SPIN_STEPS {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else if self.step < YIELD_STEPS {
            tokio::task::yield_now().await;
        } else {
            let base_ms = (1u64 << (self.step - YIELD_STEPS).min(2)).min(MAX_SLEEP_MS);
            let jitter_us = rand::thread_rng().gen_range(0..500);
            tokio::time::sleep(Duration::from_millis(base_ms) + Duration::from_micros(jitter_us))
                .await;
        }
        self.step = self.step.saturating_add(1);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until `condition` holds or `cancel` fires
///
/// Returns `true` if the condition was observed, `false` on cancellation.
pub async fn wait_until<F>(cancel: &CancellationToken, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let mut backoff = Backoff::new();
    loop {
        if condition() {
            return true;
        }
        if cancel.is_cancelled() {
            return false;
        }
        backoff.snooze().await;
    }
}
