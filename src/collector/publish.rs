use crate::aggregate::{AggregationStore, FlowCounts};
use crate::flow::CounterKind;
use crate::metrics::Metrics;
use crate::resolve::{NameMap, Resolver};

/// Outcome of one publish cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    /// Series added per counter kind, indexed by `CounterKind as usize`.
    pub per_kind: [usize; 4],
}

impl PublishStats {
    pub fn series(&self) -> usize {
        self.per_kind.iter().sum()
    }
}

/// Adds every series of a detached generation to the flow counters.
pub fn publish_counts(
    counts: &FlowCounts,
    metrics: &Metrics,
    names: Option<&NameMap>,
) -> PublishStats {
    let mut stats = PublishStats::default();

    for kind in CounterKind::all() {
        let counter = metrics.flow_counter(*kind);
        let series = counts.export(*kind, names);
        stats.per_kind[*kind as usize] = series.len();

        for s in &series {
            counter.with_label_values(&s.label_values()).inc_by(s.value);
        }
    }

    metrics.publish_cycles_total.inc();
    metrics.published_series_total.inc_by(stats.series() as u64);

    stats
}

/// Drains the store and publishes the detached generation.
///
/// Ingests racing with this call land in the next generation; nothing is
/// counted twice or lost.
pub fn publish(
    store: &AggregationStore,
    metrics: &Metrics,
    resolver: Option<&Resolver>,
) -> PublishStats {
    let drained = store.drain();
    metrics.aggregated_series.set(0);

    let names = resolver.and_then(Resolver::load);
    publish_counts(&drained, metrics, names.as_deref())
}
