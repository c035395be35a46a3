use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// A fired window boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// 1-based index of the window that just closed.
    pub window: u32,
    /// The session must end after this window is flushed.
    pub last: bool,
}

/// Window boundaries at a fixed interval, bounded to `max_intervals` per
/// session.
///
/// The first boundary is one full interval after creation; there is no
/// immediate tick.
pub struct TickScheduler {
    ticker: Interval,
    max_intervals: u32,
    fired: u32,
}

impl TickScheduler {
    pub fn new(interval: Duration, max_intervals: u32) -> Self {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Self {
            ticker,
            max_intervals: max_intervals.max(1),
            fired: 0,
        }
    }

    /// Waits for the next window boundary.
    ///
    /// Cancel-safe: dropping the future before it completes does not count
    /// a window.
    pub async fn tick(&mut self) -> Tick {
        self.ticker.tick().await;
        self.fired = self.fired.saturating_add(1);
        Tick {
            window: self.fired,
            last: self.fired >= self.max_intervals,
        }
    }

    /// Windows fired so far.
    pub fn fired(&self) -> u32 {
        self.fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_interval() {
        let start = Instant::now();
        let mut sched = TickScheduler::new(Duration::from_secs(60), 50);

        let tick = sched.tick().await;
        assert_eq!(tick, Tick { window: 1, last: false });
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_cutoff_at_max_intervals() {
        let mut sched = TickScheduler::new(Duration::from_secs(1), 3);

        assert!(!sched.tick().await.last);
        assert!(!sched.tick().await.last);
        let third = sched.tick().await;
        assert_eq!(third, Tick { window: 3, last: true });
        assert_eq!(sched.fired(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_intervals_treated_as_one() {
        let mut sched = TickScheduler::new(Duration::from_secs(1), 0);
        assert!(sched.tick().await.last);
        assert_eq!(sched.fired(), 1);
    }
}
