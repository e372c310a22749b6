use std::net::IpAddr;

use crate::flow::{CounterKind, TrafficClass};
use crate::resolve::NameMap;

/// Composite key of one aggregated series.
///
/// Hosts are port-stripped, so flows that only differ in port share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub source: String,
    pub destination: String,
    pub traffic_class: TrafficClass,
    pub proto: u8,
    pub kind: CounterKind,
}

/// One exported series: the label values plus the accumulated total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedSeries {
    pub source: String,
    pub destination: String,
    pub traffic_class: &'static str,
    pub protocol: String,
    pub value: u64,
}

impl ExportedSeries {
    /// Label values in registration order of the flow counters.
    pub fn label_values(&self) -> [&str; 4] {
        [
            &self.source,
            &self.destination,
            self.traffic_class,
            &self.protocol,
        ]
    }
}

/// Returns the display name of a host, falling back to the host itself.
pub fn display_host(host: &str, names: Option<&NameMap>) -> String {
    let Some(names) = names else {
        return host.to_string();
    };

    host.parse::<IpAddr>()
        .ok()
        .and_then(|ip| names.get(&ip))
        .cloned()
        .unwrap_or_else(|| host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn key(src: &str, port_free_dst: &str) -> FlowKey {
        FlowKey {
            source: src.to_string(),
            destination: port_free_dst.to_string(),
            traffic_class: TrafficClass::Virtual,
            proto: 6,
            kind: CounterKind::TxBytes,
        }
    }

    #[test]
    fn test_flow_key_as_map_key() {
        let mut map: HashMap<FlowKey, u64> = HashMap::new();
        map.insert(key("100.1.1.1", "100.2.2.2"), 42);
        assert_eq!(map.get(&key("100.1.1.1", "100.2.2.2")), Some(&42));
        assert_eq!(map.get(&key("100.1.1.1", "100.3.3.3")), None);
    }

    #[test]
    fn test_flow_key_kind_distinguishes() {
        let a = key("100.1.1.1", "100.2.2.2");
        let mut b = a.clone();
        b.kind = CounterKind::RxBytes;
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_host_without_names() {
        assert_eq!(display_host("100.1.1.1", None), "100.1.1.1");
    }

    #[test]
    fn test_display_host_with_names() {
        let mut names = NameMap::new();
        names.insert("100.1.1.1".parse().expect("ip"), "hello".to_string());

        assert_eq!(display_host("100.1.1.1", Some(&names)), "hello");
        assert_eq!(display_host("100.9.9.9", Some(&names)), "100.9.9.9");
        assert_eq!(display_host("-", Some(&names)), "-");
    }
}
