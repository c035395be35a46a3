use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Wall clock anchored to a monotonic instant.
///
/// Window timestamps are derived from the anchor plus monotonic elapsed time,
/// so a wall-clock step mid-session cannot make them go backwards.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    anchor_epoch: Duration,
    anchor: Instant,
}

impl SessionClock {
    /// Anchors the clock at the current wall-clock time.
    pub fn new() -> Self {
        let anchor_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::with_epoch(anchor_epoch)
    }

    /// Anchors the clock at a given epoch offset.
    pub fn with_epoch(anchor_epoch: Duration) -> Self {
        Self {
            anchor_epoch,
            anchor: Instant::now(),
        }
    }

    /// Current time in whole seconds since the Unix epoch.
    pub fn now_epoch_secs(&self) -> u64 {
        (self.anchor_epoch + self.anchor.elapsed()).as_secs()
    }

    /// Time elapsed since the clock was anchored.
    pub fn elapsed(&self) -> Duration {
        self.anchor.elapsed()
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}
