//! Activity accounting across all proxy ports.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Tracks the most recent activity (accept, first forwarded byte in either
/// direction, connection close) as milliseconds since construction.
///
/// Updates use an atomic max so a stale writer can never move the stamp
/// backwards; the idle deadline derived from it is monotonic.
pub struct IdleAccountant {
    origin: Instant,
    last_activity_ms: AtomicU64,
}

impl IdleAccountant {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    /// Record activity at the current instant.
    pub fn touch(&self) {
        let now_ms = self.origin.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now_ms, Ordering::AcqRel);
    }

    /// The instant of the most recent recorded activity.
    pub fn last_activity(&self) -> Instant {
        let ms = self.last_activity_ms.load(Ordering::Acquire);
        self.origin + std::time::Duration::from_millis(ms)
    }

    /// How long the proxy has been without activity.
    pub fn idle_for(&self) -> std::time::Duration {
        Instant::now().saturating_duration_since(self.last_activity())
    }

    /// When the idle timer should fire given the configured timeout.
    pub fn deadline(&self, inactivity_timeout: std::time::Duration) -> Instant {
        self.last_activity() + inactivity_timeout
    }
}

impl Default for IdleAccountant {
    fn default() -> Self {
        Self::new()
    }
}
