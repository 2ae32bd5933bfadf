//! Restart governor for listeners and workers.
//!
//! Exponential backoff with a cap: every death doubles the wait (starting
//! at one second, capped at [`MAX_BACKOFF`]), and a process that stayed up
//! for at least [`STABILITY_WINDOW`] earns a reset, so a long-healthy
//! listener restarts immediately while a crash-looping one is throttled.

use std::time::{Duration, Instant};

/// Upper bound on the restart interval.
pub const MAX_BACKOFF: Duration = Duration::from_secs(64);

/// Uptime after which the next death is treated as a fresh failure rather
/// than a continuation of a crash loop.
pub const STABILITY_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct Backoff {
    interval: Duration,
    deadline: Option<Instant>,
    started_at: Option<Instant>,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff {
            interval: Duration::ZERO,
            deadline: None,
            started_at: None,
        }
    }

    /// Record that the governed process was started.
    pub fn started(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Record a death and advance the restart deadline.
    pub fn died(&mut self) {
        self.died_at(Instant::now());
    }

    fn died_at(&mut self, now: Instant) {
        let stable = self
            .started_at
            .map(|t| now.saturating_duration_since(t) >= STABILITY_WINDOW)
            .unwrap_or(false);
        if stable {
            self.interval = Duration::ZERO;
        }
        self.interval = (self.interval * 2)
            .max(Duration::from_secs(1))
            .min(MAX_BACKOFF);
        self.deadline = Some(now + self.interval);
    }

    /// True while restarting is not yet permitted.
    pub fn waiting(&self) -> bool {
        self.how_long().is_some()
    }

    /// Time remaining until the next permitted start, if any.
    pub fn how_long(&self) -> Option<Duration> {
        let deadline = self.deadline?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            None
        } else {
            Some(remaining)
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
