//! Retry schedule for the peer-server link.

use std::time::Duration;

/// Delay before the first retry.
const BASE_DELAY_MS: u64 = 150;
/// Additional delay added per completed attempt.
const STEP_MS: u64 = 1000;
/// Attempts allowed before the link is declared lost.
const MAX_ATTEMPTS: u32 = 5;

/// Linear backoff with a bounded attempt budget.
///
/// Each scheduled retry waits `150ms + attempt * 1s`, so a full ladder runs
/// at 150ms, 1.15s, 2.15s, 3.15s and 4.15s. Exhausting the budget yields
/// `None` once and re-arms, so a later independent outage starts over from
/// the base delay.
#[derive(Debug, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay to wait before the next retry, or `None` when the budget is
    /// exhausted.
    pub fn schedule(&mut self) -> Option<Duration> {
        if self.attempt >= MAX_ATTEMPTS {
            self.attempt = 0;
            return None;
        }
        let delay = Duration::from_millis(BASE_DELAY_MS + u64::from(self.attempt) * STEP_MS);
        self.attempt += 1;
        Some(delay)
    }

    /// Clear the attempt counter after a successful reconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
