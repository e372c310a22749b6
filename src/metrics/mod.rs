//! Prometheus registry holding the exported flow series and exporter
//! self-observability metrics.

mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use tokio_util::sync::CancellationToken;

use crate::api::{Device, MetricsCallback};
use crate::flow::{CounterKind, TrafficClass};

/// Namespace of the exported flow series and host gauge.
pub const FLOW_NAMESPACE: &str = "tailscale";
/// Namespace of exporter self-metrics.
pub const SELF_NAMESPACE: &str = "tailflow";

/// Label names of the four flow counters.
pub const FLOW_LABELS: [&str; 4] = ["source", "destination", "traffic_class", "protocol"];
/// Label names of the host inventory gauge.
pub const HOST_LABELS: [&str; 6] = [
    "hostname",
    "update_available",
    "os",
    "is_external",
    "user",
    "client_version",
];

/// All metrics served on `/metrics`, registered on a private registry.
pub struct Metrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Flow series ===
    pub tx_bytes: IntCounterVec,
    pub rx_bytes: IntCounterVec,
    pub tx_packets: IntCounterVec,
    pub rx_packets: IntCounterVec,
    /// Devices in the tailnet; value is always 1.
    pub hosts: GaugeVec,

    // === Self metrics ===
    /// API requests by endpoint and status.
    pub api_requests_total: IntCounterVec,
    /// API request duration by endpoint.
    pub api_request_duration: HistogramVec,
    /// Failed fetches by source (network_logs/devices).
    pub fetch_errors_total: IntCounterVec,
    /// Ingested flow samples by traffic class.
    pub flow_samples_total: IntCounterVec,
    pub publish_cycles_total: IntCounter,
    /// Series pushed to the flow counters across all publish cycles.
    pub published_series_total: IntCounter,
    /// Series currently held by the aggregation store.
    pub aggregated_series: IntGauge,
    /// Addresses in the current name map.
    pub resolver_names: IntGauge,
    pub resolver_errors_total: IntCounter,
}

impl Metrics {
    /// Creates the metrics set with every series registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Flow series ===
        let tx_bytes = IntCounterVec::new(
            Opts::new("tx_bytes", "Total number of bytes transmitted").namespace(FLOW_NAMESPACE),
            &FLOW_LABELS,
        )?;
        let rx_bytes = IntCounterVec::new(
            Opts::new("rx_bytes", "Total number of bytes received").namespace(FLOW_NAMESPACE),
            &FLOW_LABELS,
        )?;
        let tx_packets = IntCounterVec::new(
            Opts::new("tx_packets", "Total number of packets transmitted")
                .namespace(FLOW_NAMESPACE),
            &FLOW_LABELS,
        )?;
        let rx_packets = IntCounterVec::new(
            Opts::new("rx_packets", "Total number of packets received").namespace(FLOW_NAMESPACE),
            &FLOW_LABELS,
        )?;
        let hosts = GaugeVec::new(
            Opts::new("hosts", "Hosts in the tailnet").namespace(FLOW_NAMESPACE),
            &HOST_LABELS,
        )?;

        // === Self metrics ===
        let api_requests_total = IntCounterVec::new(
            Opts::new(
                "api_requests_total",
                "Total control-plane API requests by endpoint and status.",
            )
            .namespace(SELF_NAMESPACE),
            &["endpoint", "status"],
        )?;
        let api_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "api_request_duration_seconds",
                "Control-plane API request duration by endpoint.",
            )
            .namespace(SELF_NAMESPACE)
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["endpoint"],
        )?;
        let fetch_errors_total = IntCounterVec::new(
            Opts::new("fetch_errors_total", "Total failed fetches by source.")
                .namespace(SELF_NAMESPACE),
            &["source"],
        )?;
        let flow_samples_total = IntCounterVec::new(
            Opts::new(
                "flow_samples_total",
                "Total ingested flow samples by traffic class.",
            )
            .namespace(SELF_NAMESPACE),
            &["traffic_class"],
        )?;
        let publish_cycles_total = IntCounter::with_opts(
            Opts::new("publish_cycles_total", "Total publish cycles.").namespace(SELF_NAMESPACE),
        )?;
        let published_series_total = IntCounter::with_opts(
            Opts::new(
                "published_series_total",
                "Total series added to the flow counters.",
            )
            .namespace(SELF_NAMESPACE),
        )?;
        let aggregated_series = IntGauge::with_opts(
            Opts::new(
                "aggregated_series",
                "Series held in memory awaiting the next publish.",
            )
            .namespace(SELF_NAMESPACE),
        )?;
        let resolver_names = IntGauge::with_opts(
            Opts::new("resolver_names", "Addresses in the current name map.")
                .namespace(SELF_NAMESPACE),
        )?;
        let resolver_errors_total = IntCounter::with_opts(
            Opts::new(
                "resolver_errors_total",
                "Total failed name map rebuilds.",
            )
            .namespace(SELF_NAMESPACE),
        )?;

        registry.register(Box::new(tx_bytes.clone()))?;
        registry.register(Box::new(rx_bytes.clone()))?;
        registry.register(Box::new(tx_packets.clone()))?;
        registry.register(Box::new(rx_packets.clone()))?;
        registry.register(Box::new(hosts.clone()))?;

        registry.register(Box::new(api_requests_total.clone()))?;
        registry.register(Box::new(api_request_duration.clone()))?;
        registry.register(Box::new(fetch_errors_total.clone()))?;
        registry.register(Box::new(flow_samples_total.clone()))?;
        registry.register(Box::new(publish_cycles_total.clone()))?;
        registry.register(Box::new(published_series_total.clone()))?;
        registry.register(Box::new(aggregated_series.clone()))?;
        registry.register(Box::new(resolver_names.clone()))?;
        registry.register(Box::new(resolver_errors_total.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            tx_bytes,
            rx_bytes,
            tx_packets,
            rx_packets,
            hosts,
            api_requests_total,
            api_request_duration,
            fetch_errors_total,
            flow_samples_total,
            publish_cycles_total,
            published_series_total,
            aggregated_series,
            resolver_names,
            resolver_errors_total,
        })
    }

    /// The counter vector carrying one counter kind.
    pub fn flow_counter(&self, kind: CounterKind) -> &IntCounterVec {
        match kind {
            CounterKind::TxBytes => &self.tx_bytes,
            CounterKind::RxBytes => &self.rx_bytes,
            CounterKind::TxPackets => &self.tx_packets,
            CounterKind::RxPackets => &self.rx_packets,
        }
    }

    /// Marks a device as present in the host inventory.
    pub fn set_host(&self, device: &Device) {
        let labels = device.host_labels();
        let values: Vec<&str> = labels.iter().map(String::as_str).collect();
        self.hosts.with_label_values(&values).set(1.0);
    }

    /// Adds ingested sample counts for one traffic class.
    pub fn record_samples(&self, class: TrafficClass, count: usize) {
        if count > 0 {
            self.flow_samples_total
                .with_label_values(&[class.as_str()])
                .inc_by(count as u64);
        }
    }

    pub fn record_fetch_error(&self, source: &str) {
        self.fetch_errors_total.with_label_values(&[source]).inc();
    }

    pub fn record_api_request(&self, endpoint: &str, status: &str, duration: Duration) {
        self.api_requests_total
            .with_label_values(&[endpoint, status])
            .inc();
        self.api_request_duration
            .with_label_values(&[endpoint])
            .observe(duration.as_secs_f64());
    }

    /// Callback wiring API client requests into the request metrics.
    pub fn api_callback(self: &Arc<Self>) -> MetricsCallback {
        let metrics = Arc::clone(self);
        Box::new(move |endpoint, status, duration| {
            metrics.record_api_request(endpoint, status, duration);
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders every registered series in the text exposition format.
    pub fn encode_text(&self) -> Result<String> {
        encode_registry(&self.registry)
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}
