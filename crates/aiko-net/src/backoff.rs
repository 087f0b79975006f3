//! Reconnection backoff: exponential from a 1 s base to a 30 s cap, with
//! ±20 % jitter so that a fleet of processes does not reconnect in lockstep.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const BASE_MS: u64 = 1_000;
const CAP_MS: u64 = 30_000;
const JITTER_FRACTION: f64 = 0.2;

pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    /// Reset after a successful connection.
    pub fn on_success(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(5); // 2^5 * 1s > 30s cap
        self.attempt = self.attempt.saturating_add(1);

        let capped = (BASE_MS << exponent).min(CAP_MS);
        let jitter = 1.0 + JITTER_FRACTION * (2.0 * jitter_unit() - 1.0);
        Duration::from_millis((capped as f64 * jitter) as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Uniform-ish value in [0, 1) from the clock's sub-second noise.
fn jitter_unit() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1_000) as f64 / 1_000.0
}

// ── Tests ─────────────────────────────────────────────────────────────────────
