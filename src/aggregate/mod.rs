//! In-memory aggregation of flow counters between publish cycles.

pub mod dimension;

use std::collections::HashMap;
use std::mem;

use parking_lot::RwLock;

use crate::flow::{strip_port, CounterKind, FlowSample, NetworkLogs, TrafficClass};
use crate::resolve::NameMap;

pub use self::dimension::{display_host, ExportedSeries, FlowKey};

/// One generation of accumulated counters.
///
/// Produced by [`AggregationStore::drain`]; owns its series outright, so
/// exporting from it cannot race with ingestion into the live store.
#[derive(Debug, Default, Clone)]
pub struct FlowCounts {
    series: HashMap<FlowKey, u64>,
}

impl FlowCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds all four counters of a sample.
    pub fn add(&mut self, sample: &FlowSample, class: TrafficClass) {
        let source = strip_port(&sample.src);
        let destination = strip_port(&sample.dst);

        for kind in CounterKind::all() {
            let key = FlowKey {
                source: source.clone(),
                destination: destination.clone(),
                traffic_class: class,
                proto: sample.proto,
                kind: *kind,
            };
            let slot = self.series.entry(key).or_insert(0);
            *slot = slot.saturating_add(sample.counter(*kind));
        }
    }

    /// Returns every series of one counter kind, with hosts replaced by
    /// their display names when a name map is given.
    pub fn export(&self, kind: CounterKind, names: Option<&NameMap>) -> Vec<ExportedSeries> {
        self.series
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .map(|(key, value)| ExportedSeries {
                source: display_host(&key.source, names),
                destination: display_host(&key.destination, names),
                traffic_class: key.traffic_class.as_str(),
                protocol: key.proto.to_string(),
                value: *value,
            })
            .collect()
    }

    /// Value of a single series, if present.
    pub fn get(&self, key: &FlowKey) -> Option<u64> {
        self.series.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

/// Per-class sample counts from one ingested batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub virtual_samples: usize,
    pub subnet_samples: usize,
    pub exit_samples: usize,
    pub physical_samples: usize,
}

impl IngestStats {
    fn from_counts(counts: [usize; 4]) -> Self {
        Self {
            virtual_samples: counts[TrafficClass::Virtual as usize],
            subnet_samples: counts[TrafficClass::Subnet as usize],
            exit_samples: counts[TrafficClass::Exit as usize],
            physical_samples: counts[TrafficClass::Physical as usize],
        }
    }

    /// Sample count for one class.
    pub fn get(&self, class: TrafficClass) -> usize {
        match class {
            TrafficClass::Virtual => self.virtual_samples,
            TrafficClass::Subnet => self.subnet_samples,
            TrafficClass::Exit => self.exit_samples,
            TrafficClass::Physical => self.physical_samples,
        }
    }

    pub fn total(&self) -> usize {
        self.virtual_samples + self.subnet_samples + self.exit_samples + self.physical_samples
    }
}

/// Thread-safe store of the live counter generation.
///
/// A single lock guards the whole map: ingest takes it once per sample for
/// all four counters, and [`drain`](Self::drain) swaps the map out under the
/// same lock.
#[derive(Debug, Default)]
pub struct AggregationStore {
    live: RwLock<FlowCounts>,
}

impl AggregationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulates one sample.
    pub fn ingest(&self, sample: &FlowSample, class: TrafficClass) {
        self.live.write().add(sample, class);
    }

    /// Accumulates every sample of a fetched batch.
    ///
    /// The lock is taken per sample so a concurrent drain is never blocked
    /// for the duration of a large batch.
    pub fn ingest_logs(&self, logs: &NetworkLogs) -> IngestStats {
        for msg in &logs.logs {
            for (class, sample) in msg.samples() {
                self.ingest(sample, class);
            }
        }

        IngestStats::from_counts(logs.class_counts())
    }

    /// Snapshot of the live series of one counter kind.
    pub fn export(&self, kind: CounterKind, names: Option<&NameMap>) -> Vec<ExportedSeries> {
        self.live.read().export(kind, names)
    }

    /// Discards every live series.
    pub fn reset(&self) {
        *self.live.write() = FlowCounts::new();
    }

    /// Detaches the live generation and leaves an empty one in its place.
    pub fn drain(&self) -> FlowCounts {
        mem::take(&mut *self.live.write())
    }

    /// Number of live series.
    pub fn len(&self) -> usize {
        self.live.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sample() -> FlowSample {
        FlowSample {
            proto: 6,
            src: "100.1.1.1:1111".to_string(),
            dst: "100.2.2.2:2222".to_string(),
            tx_packets: 1,
            tx_bytes: 2,
            rx_packets: 3,
            rx_bytes: 4,
        }
    }

    fn tuples(series: Vec<ExportedSeries>) -> Vec<(String, String, &'static str, String, u64)> {
        let mut out: Vec<_> = series
            .into_iter()
            .map(|s| (s.source, s.destination, s.traffic_class, s.protocol, s.value))
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_ingest_creates_four_series() {
        let store = AggregationStore::new();
        store.ingest(&sample(), TrafficClass::Virtual);
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_export_single_sample() {
        let store = AggregationStore::new();
        store.ingest(&sample(), TrafficClass::Virtual);

        let expected = |v: u64| {
            vec![(
                "100.1.1.1".to_string(),
                "100.2.2.2".to_string(),
                "virtual",
                "6".to_string(),
                v,
            )]
        };

        assert_eq!(tuples(store.export(CounterKind::TxPackets, None)), expected(1));
        assert_eq!(tuples(store.export(CounterKind::TxBytes, None)), expected(2));
        assert_eq!(tuples(store.export(CounterKind::RxPackets, None)), expected(3));
        assert_eq!(tuples(store.export(CounterKind::RxBytes, None)), expected(4));
    }

    #[test]
    fn test_double_ingest_doubles() {
        let store = AggregationStore::new();
        store.ingest(&sample(), TrafficClass::Virtual);
        store.ingest(&sample(), TrafficClass::Virtual);

        let series = store.export(CounterKind::RxBytes, None);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].value, 8);
    }

    #[test]
    fn test_ports_collapse_into_one_series() {
        let store = AggregationStore::new();
        let mut other = sample();
        other.src = "100.1.1.1:5555".to_string();
        other.dst = "100.2.2.2:6666".to_string();

        store.ingest(&sample(), TrafficClass::Virtual);
        store.ingest(&other, TrafficClass::Virtual);

        assert_eq!(store.len(), 4);
        assert_eq!(store.export(CounterKind::TxBytes, None)[0].value, 4);
    }

    #[test]
    fn test_traffic_class_separates_series() {
        let store = AggregationStore::new();
        store.ingest(&sample(), TrafficClass::Virtual);
        store.ingest(&sample(), TrafficClass::Exit);

        let series = tuples(store.export(CounterKind::TxPackets, None));
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].2, "exit");
        assert_eq!(series[1].2, "virtual");
    }

    #[test]
    fn test_malformed_endpoints_use_sentinel() {
        let store = AggregationStore::new();
        let mut bad = sample();
        bad.src = String::new();
        bad.dst = "not-an-endpoint".to_string();
        store.ingest(&bad, TrafficClass::Exit);

        let series = store.export(CounterKind::TxPackets, None);
        assert_eq!(series[0].source, "-");
        assert_eq!(series[0].destination, "-");
    }

    #[test]
    fn test_saturating_add() {
        let store = AggregationStore::new();
        let mut big = sample();
        big.tx_bytes = u64::MAX - 1;
        store.ingest(&big, TrafficClass::Virtual);
        store.ingest(&big, TrafficClass::Virtual);

        assert_eq!(store.export(CounterKind::TxBytes, None)[0].value, u64::MAX);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let store = AggregationStore::new();
        store.ingest(&sample(), TrafficClass::Virtual);

        store.reset();
        assert!(store.is_empty());
        store.reset();
        assert!(store.is_empty());

        for kind in CounterKind::all() {
            assert!(store.export(*kind, None).is_empty());
        }
    }

    #[test]
    fn test_drain_detaches_generation() {
        let store = AggregationStore::new();
        store.ingest(&sample(), TrafficClass::Virtual);

        let drained = store.drain();
        assert_eq!(drained.len(), 4);
        assert!(store.is_empty());

        store.ingest(&sample(), TrafficClass::Virtual);
        assert_eq!(drained.export(CounterKind::RxBytes, None)[0].value, 4);
        assert_eq!(store.export(CounterKind::RxBytes, None)[0].value, 4);
    }

    #[test]
    fn test_export_resolves_names() {
        let store = AggregationStore::new();
        store.ingest(&sample(), TrafficClass::Virtual);

        let mut names = NameMap::new();
        names.insert("100.1.1.1".parse().expect("ip"), "hello".to_string());

        let series = store.export(CounterKind::TxBytes, Some(&names));
        assert_eq!(series[0].source, "hello");
        assert_eq!(series[0].destination, "100.2.2.2");
    }

    #[test]
    fn test_ingest_logs_reports_class_counts() {
        let logs: NetworkLogs = serde_json::from_str(
            r#"{"logs":[{"virtualTraffic":[
                {"proto":6,"src":"100.1.1.1:1","dst":"100.2.2.2:2","txPkts":1},
                {"proto":17,"src":"100.1.1.1:1","dst":"100.2.2.2:2","txPkts":1}
            ],"exitTraffic":[{"proto":6,"src":"100.1.1.1:1","dst":"8.8.8.8:53"}]}]}"#,
        )
        .expect("valid logs");

        let store = AggregationStore::new();
        let stats = store.ingest_logs(&logs);

        assert_eq!(stats.virtual_samples, 2);
        assert_eq!(stats.exit_samples, 1);
        assert_eq!(stats.get(TrafficClass::Subnet), 0);
        assert_eq!(stats.total(), 3);
        assert_eq!(store.len(), 12);
    }

    #[test]
    fn test_concurrent_ingest() {
        let store = Arc::new(AggregationStore::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        store.ingest(&sample(), TrafficClass::Virtual);
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().expect("ingest thread");
        }

        assert_eq!(store.export(CounterKind::TxPackets, None)[0].value, 8000);
        assert_eq!(store.export(CounterKind::RxBytes, None)[0].value, 32000);
    }

    #[test]
    fn test_concurrent_ingest_and_drain_loses_nothing() {
        let store = Arc::new(AggregationStore::new());
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..5000 {
                    store.ingest(&sample(), TrafficClass::Virtual);
                }
            })
        };

        let mut total = 0;
        for _ in 0..50 {
            let drained = store.drain();
            total += drained
                .export(CounterKind::TxPackets, None)
                .iter()
                .map(|s| s.value)
                .sum::<u64>();
        }
        writer.join().expect("writer thread");
        total += store
            .drain()
            .export(CounterKind::TxPackets, None)
            .iter()
            .map(|s| s.value)
            .sum::<u64>();

        assert_eq!(total, 5000);
    }
}
