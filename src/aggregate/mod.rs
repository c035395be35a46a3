pub mod accumulator;
pub mod key;
pub mod sample;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::capture::event::{OpKind, OperationEvent};
use crate::ident::IdentifierEncoder;

use self::accumulator::Aggregate;
use self::key::{MetricFamily, MetricKey, MetricName, ScopeKind};
use self::sample::{MetricSample, WindowSnapshot};

/// Accumulators for the window currently open.
#[derive(Debug, Default)]
struct WindowState {
    events: u64,
    writes: u64,
    series: BTreeMap<MetricKey, Aggregate>,
}

/// Windowed aggregation of operation events keyed by (object, metric).
///
/// All window state sits behind one mutex. `record` holds it for one event's
/// updates and `snapshot_and_reset` holds it only to swap the window out, so
/// an event lands in exactly one window and a returned snapshot never sees
/// later events.
pub struct Aggregator {
    window: Duration,
    encoder: Arc<IdentifierEncoder>,
    state: Mutex<WindowState>,
}

impl Aggregator {
    /// Creates an aggregator for windows of length `window`.
    pub fn new(window: Duration, encoder: Arc<IdentifierEncoder>) -> Self {
        Self {
            window,
            encoder,
            state: Mutex::new(WindowState::default()),
        }
    }

    /// Ingests one event.
    ///
    /// Per scope and family, the event updates its op-specific series and
    /// the combined series: 12 accumulator updates in total.
    pub fn record(&self, event: &OperationEvent) {
        let pool = self.encoder.encode(event.pool_guid);
        let dataset = self.encoder.encode(event.dataset_guid);

        let mut state = self.state.lock();
        state.events = state.events.saturating_add(1);
        if event.kind == OpKind::Write {
            state.writes = state.writes.saturating_add(1);
        }

        for (scope, dataset) in [(ScopeKind::Pool, None), (ScopeKind::Dataset, Some(&dataset))] {
            for family in MetricFamily::ALL {
                let value = family.value_of(event);
                for kind in [Some(event.kind), None] {
                    let key = MetricKey {
                        scope,
                        pool: Arc::clone(&pool),
                        dataset: dataset.cloned(),
                        metric: MetricName::new(family, kind),
                    };
                    state
                        .series
                        .entry(key)
                        .or_insert_with(|| Aggregate::for_family(family))
                        .record(value);
                }
            }
        }
    }

    /// Closes the current window and opens an empty one.
    ///
    /// Returns normalized samples ordered by key, stamped with `timestamp`
    /// (epoch seconds). Series without events are not present.
    pub fn snapshot_and_reset(&self, timestamp: u64) -> WindowSnapshot {
        let WindowState {
            events,
            writes,
            series,
        } = std::mem::take(&mut *self.state.lock());

        let window_secs = self.window.as_secs_f64();
        let samples: Vec<MetricSample> = series
            .into_iter()
            .filter_map(|(key, agg)| {
                agg.normalize(window_secs).map(|value| MetricSample {
                    key,
                    value,
                    timestamp,
                })
            })
            .collect();

        WindowSnapshot {
            timestamp,
            interval: self.window,
            events,
            writes,
            samples,
        }
    }

    /// Number of series with data in the open window.
    pub fn pending_series(&self) -> usize {
        self.state.lock().series.len()
    }

    /// Number of events recorded in the open window.
    pub fn pending_events(&self) -> u64 {
        self.state.lock().events
    }
}
