use super::key::MetricFamily;

/// Conversion from the capture clock (ns) to published latency (us).
pub const NANOS_PER_MICRO: f64 = 1_000.0;

/// Running accumulator for one series within a window.
///
/// Accumulation is a plain sum or count; the divide by window length (or by
/// count for latency) happens once, in [`Aggregate::normalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    /// Latency: sum and count of elapsed nanoseconds.
    Mean { sum: u64, count: u64 },
    /// Bandwidth: sum of bytes.
    Sum { sum: u64, count: u64 },
    /// IOPS: number of events.
    Count { count: u64 },
}

impl Aggregate {
    /// Creates an empty accumulator suited to `family`.
    pub const fn for_family(family: MetricFamily) -> Self {
        match family {
            MetricFamily::Latency => Self::Mean { sum: 0, count: 0 },
            MetricFamily::Bandwidth => Self::Sum { sum: 0, count: 0 },
            MetricFamily::Iops => Self::Count { count: 0 },
        }
    }

    /// Records one event's contribution.
    pub fn record(&mut self, value: u64) {
        match self {
            Self::Mean { sum, count } | Self::Sum { sum, count } => {
                *sum = sum.saturating_add(value);
                *count = count.saturating_add(1);
            }
            Self::Count { count } => {
                *count = count.saturating_add(1);
            }
        }
    }

    /// Number of events recorded.
    pub fn count(&self) -> u64 {
        match *self {
            Self::Mean { count, .. } | Self::Sum { count, .. } | Self::Count { count } => count,
        }
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Converts the window's accumulation into a published value.
    ///
    /// Latency becomes mean microseconds; bandwidth and IOPS become rates
    /// over `window_secs`. Returns `None` for an empty accumulator or a
    /// non-positive window.
    pub fn normalize(&self, window_secs: f64) -> Option<f64> {
        if self.is_empty() {
            return None;
        }

        match *self {
            Self::Mean { sum, count } => Some(sum as f64 / count as f64 / NANOS_PER_MICRO),
            Self::Sum { sum, .. } if window_secs > 0.0 => Some(sum as f64 / window_secs),
            Self::Count { count } if window_secs > 0.0 => Some(count as f64 / window_secs),
            _ => None,
        }
    }
}
