//! Periodic collection loops feeding the aggregation store and the host
//! inventory.

pub mod publish;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::{AggregationStore, IngestStats};
use crate::api::{DeviceSource, FlowLogSource, LogWindow};
use crate::flow::TrafficClass;
use crate::metrics::Metrics;
use crate::resolve::Resolver;

pub use self::publish::{publish, publish_counts, PublishStats};

/// Fetch-error source label for flow logs.
const SOURCE_NETWORK_LOGS: &str = "network_logs";
/// Fetch-error source label for the device directory.
const SOURCE_DEVICES: &str = "devices";

/// Fetches flow logs, ingests them, and publishes once per interval.
pub struct FlowCollector<S> {
    source: Arc<S>,
    store: Arc<AggregationStore>,
    metrics: Arc<Metrics>,
    resolver: Option<Arc<Resolver>>,
    poll_interval: Duration,
    log_window: Duration,
}

impl<S: FlowLogSource + 'static> FlowCollector<S> {
    pub fn new(
        source: Arc<S>,
        store: Arc<AggregationStore>,
        metrics: Arc<Metrics>,
        poll_interval: Duration,
        log_window: Duration,
    ) -> Self {
        Self {
            source,
            store,
            metrics,
            resolver: None,
            poll_interval,
            log_window,
        }
    }

    /// Resolve endpoint names through the given resolver when publishing.
    pub fn with_resolver(mut self, resolver: Arc<Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Fetches the just-elapsed window and ingests it.
    ///
    /// Returns `None` when the fetch failed or was cancelled.
    pub async fn collect_once(&self, cancel: &CancellationToken) -> Option<IngestStats> {
        let window = match LogWindow::last(self.log_window) {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "computing log window");
                return None;
            }
        };

        let fetched = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = self.source.fetch_logs(window) => result,
        };

        let logs = match fetched {
            Ok(logs) => logs,
            Err(e) => {
                self.metrics.record_fetch_error(SOURCE_NETWORK_LOGS);
                warn!(error = %e, "network log fetch failed, skipping interval");
                return None;
            }
        };

        // A batch that arrives after shutdown began is dropped unaccounted.
        if cancel.is_cancelled() {
            return None;
        }

        let stats = self.store.ingest_logs(&logs);
        for class in TrafficClass::all() {
            self.metrics.record_samples(*class, stats.get(*class));
        }
        self.metrics.aggregated_series.set(self.store.len() as i64);

        info!(
            messages = logs.logs.len(),
            virtual_samples = stats.virtual_samples,
            subnet_samples = stats.subnet_samples,
            exit_samples = stats.exit_samples,
            physical_samples = stats.physical_samples,
            "ingested network logs"
        );

        Some(stats)
    }

    /// Drains the store into the flow counters.
    pub fn publish(&self) -> PublishStats {
        publish(&self.store, &self.metrics, self.resolver.as_deref())
    }

    /// Runs until cancelled, then publishes anything still buffered.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval = ?self.poll_interval,
            window = ?self.log_window,
            "flow collector started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.collect_once(&cancel).await.is_some() {
                        let stats = self.publish();
                        info!(series = stats.series(), "published flow counters");
                    }
                }
            }
        }

        if !self.store.is_empty() {
            let stats = self.publish();
            info!(series = stats.series(), "final publish on shutdown");
        }
    }
}

/// Polls the device directory, updating the host gauge and name map.
pub struct DeviceCollector<S> {
    source: Arc<S>,
    metrics: Arc<Metrics>,
    resolver: Option<Arc<Resolver>>,
    poll_interval: Duration,
}

impl<S: DeviceSource + 'static> DeviceCollector<S> {
    pub fn new(source: Arc<S>, metrics: Arc<Metrics>, poll_interval: Duration) -> Self {
        Self {
            source,
            metrics,
            resolver: None,
            poll_interval,
        }
    }

    /// Rebuild the given resolver on every poll.
    pub fn with_resolver(mut self, resolver: Arc<Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Fetches the directory once and applies it.
    ///
    /// Returns the number of devices seen. A failed name map rebuild is an
    /// error; the host gauge is still updated and the previous map kept.
    pub async fn refresh_once(&self) -> Result<usize> {
        let devices = match self.source.fetch_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                self.metrics.record_fetch_error(SOURCE_DEVICES);
                return Err(e);
            }
        };

        for device in &devices {
            self.metrics.set_host(device);
        }

        if let Some(resolver) = &self.resolver {
            match resolver.rebuild(&devices) {
                Ok(names) => {
                    self.metrics.resolver_names.set(names as i64);
                    debug!(names, "rebuilt name map");
                }
                Err(e) => {
                    self.metrics.resolver_errors_total.inc();
                    return Err(e.into());
                }
            }
        }

        Ok(devices.len())
    }

    /// Runs until cancelled.
    ///
    /// With `initial_done` the first poll waits a full interval, for callers
    /// that already refreshed during startup.
    pub async fn run(self, cancel: CancellationToken, initial_done: bool) {
        let start = if initial_done {
            Instant::now() + self.poll_interval
        } else {
            Instant::now()
        };
        let mut ticker = tokio::time::interval_at(start, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval = ?self.poll_interval, "device collector started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => return,
                        result = self.refresh_once() => result,
                    };

                    match result {
                        Ok(count) => info!(devices = count, "refreshed device directory"),
                        Err(e) if self.resolver.is_some() => {
                            error!(error = %e, "device refresh failed, keeping previous name map");
                        }
                        Err(e) => warn!(error = %e, "device refresh failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Device;
    use crate::flow::{CounterKind, FlowSample, LogMessage, NetworkLogs};
    use anyhow::bail;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    /// Serves a fixed batch, or fails when `fail` is set.
    struct StaticLogs {
        logs: NetworkLogs,
        fail: bool,
        calls: AtomicUsize,
    }

    impl StaticLogs {
        fn new(fail: bool) -> Self {
            Self {
                logs: NetworkLogs {
                    logs: vec![LogMessage {
                        virtual_traffic: vec![sample()],
                        ..Default::default()
                    }],
                },
                fail,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl FlowLogSource for StaticLogs {
        async fn fetch_logs(&self, _window: LogWindow) -> Result<NetworkLogs> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                bail!("unexpected status 500");
            }
            Ok(self.logs.clone())
        }
    }

    /// Serves the next queued directory snapshot.
    struct QueuedDevices {
        snapshots: Mutex<Vec<Result<Vec<Device>>>>,
    }

    impl DeviceSource for QueuedDevices {
        async fn fetch_devices(&self) -> Result<Vec<Device>> {
            let mut queue = self.snapshots.lock();
            if queue.is_empty() {
                bail!("no snapshot queued");
            }
            queue.remove(0)
        }
    }

    fn device(name: &str, addr: &str) -> Device {
        Device {
            name: name.to_string(),
            hostname: name.to_string(),
            addresses: vec![addr.to_string()],
            ..Default::default()
        }
    }

    fn flow_collector(source: Arc<StaticLogs>) -> (FlowCollector<StaticLogs>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new(":0").expect("metrics"));
        let collector = FlowCollector::new(
            source,
            Arc::new(AggregationStore::new()),
            Arc::clone(&metrics),
            Duration::from_secs(45),
            Duration::from_secs(45),
        );
        (collector, metrics)
    }

    #[tokio::test]
    async fn test_collect_once_ingests_batch() {
        let (collector, metrics) = flow_collector(Arc::new(StaticLogs::new(false)));
        let cancel = CancellationToken::new();

        let stats = collector.collect_once(&cancel).await.expect("ingested");
        assert_eq!(stats.virtual_samples, 1);
        assert_eq!(metrics.aggregated_series.get(), 4);
        assert_eq!(
            metrics
                .flow_samples_total
                .with_label_values(&["virtual"])
                .get(),
            1
        );

        let published = collector.publish();
        assert_eq!(published.series(), 4);
        assert_eq!(metrics.aggregated_series.get(), 0);
    }

    #[tokio::test]
    async fn test_collect_once_failure_skips_interval() {
        let (collector, metrics) = flow_collector(Arc::new(StaticLogs::new(true)));
        let cancel = CancellationToken::new();

        assert!(collector.collect_once(&cancel).await.is_none());
        assert!(collector.store.is_empty());
        assert_eq!(
            metrics
                .fetch_errors_total
                .with_label_values(&[SOURCE_NETWORK_LOGS])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_collect_once_cancelled_does_not_fetch() {
        let source = Arc::new(StaticLogs::new(false));
        let (collector, _metrics) = flow_collector(Arc::clone(&source));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(collector.collect_once(&cancel).await.is_none());
        assert!(collector.store.is_empty());
    }

    #[tokio::test]
    async fn test_run_publishes_then_stops() {
        let source = Arc::new(StaticLogs::new(false));
        let (collector, metrics) = flow_collector(Arc::clone(&source));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(collector.run(cancel.clone()));

        // The first tick fires immediately.
        for _ in 0..100 {
            if metrics.publish_cycles_total.get() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.expect("collector task");

        assert_eq!(source.calls.load(Ordering::Relaxed), 1);
        let labels = ["100.1.1.1", "100.2.2.2", "virtual", "6"];
        assert_eq!(
            metrics
                .flow_counter(CounterKind::RxBytes)
                .with_label_values(&labels)
                .get(),
            4
        );
    }

    #[tokio::test]
    async fn test_refresh_sets_hosts_and_names() {
        let source = Arc::new(QueuedDevices {
            snapshots: Mutex::new(vec![Ok(vec![
                device("alpha.example.ts.net", "100.1.1.1"),
                device("beta.example.ts.net", "100.2.2.2"),
            ])]),
        });
        let metrics = Arc::new(Metrics::new(":0").expect("metrics"));
        let resolver = Arc::new(Resolver::new());
        let collector = DeviceCollector::new(source, Arc::clone(&metrics), Duration::from_secs(45))
            .with_resolver(Arc::clone(&resolver));

        let count = collector.refresh_once().await.expect("refresh");
        assert_eq!(count, 2);
        assert_eq!(metrics.resolver_names.get(), 2);

        let names = resolver.load().expect("name map");
        assert_eq!(names[&"100.2.2.2".parse::<std::net::IpAddr>().expect("ip")], "beta");

        let gauge = metrics.hosts.with_label_values(&[
            "alpha.example.ts.net",
            "false",
            "",
            "false",
            "",
            "",
        ]);
        assert_eq!(gauge.get(), 1.0);
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_previous_names() {
        let source = Arc::new(QueuedDevices {
            snapshots: Mutex::new(vec![
                Ok(vec![device("alpha", "100.1.1.1")]),
                Ok(vec![device("dup", "100.2.2.2"), device("dup", "100.3.3.3")]),
            ]),
        });
        let metrics = Arc::new(Metrics::new(":0").expect("metrics"));
        let resolver = Arc::new(Resolver::new());
        let collector = DeviceCollector::new(source, Arc::clone(&metrics), Duration::from_secs(45))
            .with_resolver(Arc::clone(&resolver));

        collector.refresh_once().await.expect("first refresh");
        assert!(collector.refresh_once().await.is_err());
        assert!(collector.refresh_once().await.is_err());

        assert_eq!(metrics.resolver_errors_total.get(), 1);
        assert_eq!(
            metrics
                .fetch_errors_total
                .with_label_values(&[SOURCE_DEVICES])
                .get(),
            1
        );

        let names = resolver.load().expect("previous map");
        assert_eq!(names[&"100.1.1.1".parse::<std::net::IpAddr>().expect("ip")], "alpha");
    }
}
