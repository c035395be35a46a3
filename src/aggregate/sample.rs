use std::time::Duration;

use super::key::{MetricKey, MetricName, ScopeKind};

/// A normalized value ready for transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub key: MetricKey,
    pub value: f64,
    /// Wall-clock epoch seconds of the window close.
    pub timestamp: u64,
}

/// Everything produced by closing one window.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    /// Wall-clock epoch seconds of the window close.
    pub timestamp: u64,
    /// Window length the rates were normalized over.
    pub interval: Duration,
    /// Events recorded during the window.
    pub events: u64,
    /// Of `events`, how many were writes.
    pub writes: u64,
    /// Samples ordered by key.
    pub samples: Vec<MetricSample>,
}

impl WindowSnapshot {
    /// Number of samples in the snapshot.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Reads recorded during the window.
    pub fn reads(&self) -> u64 {
        self.events - self.writes
    }

    /// Whether the window produced no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Looks up a sample by scope, dataset presence and metric name.
    pub fn value(
        &self,
        scope: ScopeKind,
        pool: &str,
        dataset: Option<&str>,
        metric: MetricName,
    ) -> Option<f64> {
        self.samples
            .iter()
            .find(|s| {
                s.key.scope == scope
                    && &*s.key.pool == pool
                    && s.key.dataset.as_deref() == dataset
                    && s.key.metric == metric
            })
            .map(|s| s.value)
    }
}
