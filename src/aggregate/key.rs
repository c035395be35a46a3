use std::fmt;
use std::sync::Arc;

use crate::capture::event::{OpKind, OperationEvent};

/// Aggregation granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKind {
    /// Per pool, all datasets combined.
    Pool,
    /// Per pool and dataset.
    Dataset,
}

impl ScopeKind {
    /// Returns the collectd plugin name used in metric paths.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Pool => "pool",
            Self::Dataset => "dataset",
        }
    }
}

/// Metric family; decides how values are accumulated and normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricFamily {
    /// Mean elapsed time, published in microseconds.
    Latency,
    /// Byte sum, published in bytes/sec.
    Bandwidth,
    /// Event count, published in ops/sec.
    Iops,
}

impl MetricFamily {
    /// All families in publication order.
    pub const ALL: [MetricFamily; 3] = [Self::Latency, Self::Bandwidth, Self::Iops];

    /// Value an event contributes to this family's accumulator.
    pub fn value_of(self, event: &OperationEvent) -> u64 {
        match self {
            Self::Latency => event.elapsed_ns(),
            Self::Bandwidth => event.bytes,
            Self::Iops => 1,
        }
    }
}

/// A published metric: a family, optionally qualified by operation kind.
///
/// `kind: None` is the combined read+write series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricName {
    pub family: MetricFamily,
    pub kind: Option<OpKind>,
}

impl MetricName {
    /// All nine metric names.
    pub const ALL: [MetricName; 9] = [
        Self::new(MetricFamily::Latency, None),
        Self::new(MetricFamily::Latency, Some(OpKind::Read)),
        Self::new(MetricFamily::Latency, Some(OpKind::Write)),
        Self::new(MetricFamily::Bandwidth, None),
        Self::new(MetricFamily::Bandwidth, Some(OpKind::Read)),
        Self::new(MetricFamily::Bandwidth, Some(OpKind::Write)),
        Self::new(MetricFamily::Iops, None),
        Self::new(MetricFamily::Iops, Some(OpKind::Read)),
        Self::new(MetricFamily::Iops, Some(OpKind::Write)),
    ];

    pub const fn new(family: MetricFamily, kind: Option<OpKind>) -> Self {
        Self { family, kind }
    }

    /// Returns the published name (`lat`, `rbw`, `wiops`, ...).
    pub const fn as_str(self) -> &'static str {
        match (self.family, self.kind) {
            (MetricFamily::Latency, None) => "lat",
            (MetricFamily::Latency, Some(OpKind::Read)) => "rlat",
            (MetricFamily::Latency, Some(OpKind::Write)) => "wlat",
            (MetricFamily::Bandwidth, None) => "bw",
            (MetricFamily::Bandwidth, Some(OpKind::Read)) => "rbw",
            (MetricFamily::Bandwidth, Some(OpKind::Write)) => "wbw",
            (MetricFamily::Iops, None) => "iops",
            (MetricFamily::Iops, Some(OpKind::Read)) => "riops",
            (MetricFamily::Iops, Some(OpKind::Write)) => "wiops",
        }
    }

    /// Convert from the published name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.as_str() == name)
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one accumulated series.
///
/// Ordering is scope, pool token, dataset token, metric, which is the order
/// samples are published in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub scope: ScopeKind,
    pub pool: Arc<str>,
    /// Present only for [`ScopeKind::Dataset`].
    pub dataset: Option<Arc<str>>,
    pub metric: MetricName,
}

impl MetricKey {
    /// collectd plugin and plugin-instance: `pool-<P>` or `dataset-<P>-<D>`.
    pub fn plugin_path(&self) -> String {
        match &self.dataset {
            Some(dataset) => format!("{}-{}-{}", self.scope.tag(), self.pool, dataset),
            None => format!("{}-{}", self.scope.tag(), self.pool),
        }
    }

    /// Path below the node name: `<plugin_path>/gauge-<metric>`.
    pub fn metric_path(&self) -> String {
        format!("{}/gauge-{}", self.plugin_path(), self.metric)
    }
}
