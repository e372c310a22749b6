//! Flow samples as reported by the network-logs API.

mod logs;

use std::fmt;
use std::net::SocketAddr;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

pub use self::logs::{LogMessage, NetworkLogs};

/// Host placeholder used when an endpoint is not a well-formed `ip:port`.
pub const NO_HOST: &str = "-";

/// TrafficClass identifies how a flow was observed on the tailnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TrafficClass {
    /// Node-to-node traffic over the overlay network.
    Virtual = 0,
    /// Node-to-external traffic through an advertised subnet route.
    Subnet = 1,
    /// Node-to-internet traffic through an exit node.
    Exit = 2,
    /// Underlying transport-level observation of overlay traffic.
    Physical = 3,
}

impl TrafficClass {
    /// Returns the label value used in exported series.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Virtual => "virtual",
            Self::Subnet => "subnet",
            Self::Exit => "exit",
            Self::Physical => "physical",
        }
    }

    /// Convert from the label value.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "virtual" => Some(Self::Virtual),
            "subnet" => Some(Self::Subnet),
            "exit" => Some(Self::Exit),
            "physical" => Some(Self::Physical),
            _ => None,
        }
    }

    /// Return all traffic classes in wire order.
    pub fn all() -> &'static [Self] {
        &[Self::Virtual, Self::Subnet, Self::Exit, Self::Physical]
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CounterKind selects one of the four counters carried by a flow sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum CounterKind {
    TxPackets = 0,
    RxPackets = 1,
    TxBytes = 2,
    RxBytes = 3,
}

impl CounterKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TxPackets => "tx_packets",
            Self::RxPackets => "rx_packets",
            Self::TxBytes => "tx_bytes",
            Self::RxBytes => "rx_bytes",
        }
    }

    /// Maps an exported metric name (e.g. `tailscale_rx_bytes`) to the counter
    /// it carries, matching on the name suffix.
    pub fn from_metric_name(name: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|kind| name.ends_with(kind.as_str()))
    }

    pub fn all() -> &'static [Self] {
        &[Self::TxPackets, Self::RxPackets, Self::TxBytes, Self::RxBytes]
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed connection and its counters over a log window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FlowSample {
    /// IANA protocol number (6 = TCP, 17 = UDP, ...).
    #[serde(deserialize_with = "deserialize_proto")]
    pub proto: u8,
    /// Source endpoint, usually `ip:port`. May be empty for exit traffic.
    pub src: String,
    /// Destination endpoint, usually `ip:port`.
    pub dst: String,
    #[serde(rename = "txPkts")]
    pub tx_packets: u64,
    #[serde(rename = "txBytes")]
    pub tx_bytes: u64,
    #[serde(rename = "rxPkts")]
    pub rx_packets: u64,
    #[serde(rename = "rxBytes")]
    pub rx_bytes: u64,
}

impl FlowSample {
    /// Returns the value of the given counter.
    pub fn counter(&self, kind: CounterKind) -> u64 {
        match kind {
            CounterKind::TxPackets => self.tx_packets,
            CounterKind::RxPackets => self.rx_packets,
            CounterKind::TxBytes => self.tx_bytes,
            CounterKind::RxBytes => self.rx_bytes,
        }
    }
}

/// Strips the port from an `ip:port` endpoint.
///
/// Returns the canonical text form of the IP, or [`NO_HOST`] if the input is
/// not a socket address. IPv6 endpoints must be bracketed (`[fd7a::1]:41641`).
pub fn strip_port(endpoint: &str) -> String {
    match endpoint.parse::<SocketAddr>() {
        Ok(addr) => addr.ip().to_canonical().to_string(),
        Err(_) => NO_HOST.to_string(),
    }
}

/// Maps well-known protocol names to their IANA numbers.
fn proto_from_name(name: &str) -> Option<u8> {
    match name.to_ascii_lowercase().as_str() {
        "icmp" => Some(1),
        "igmp" => Some(2),
        "tcp" => Some(6),
        "udp" => Some(17),
        "dccp" => Some(33),
        "gre" => Some(47),
        "icmpv6" | "ipv6-icmp" => Some(58),
        "sctp" => Some(132),
        "tsmp" => Some(99),
        _ => None,
    }
}

/// Accepts the protocol as a JSON number, a numeric string or a known name.
fn deserialize_proto<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    struct ProtoVisitor;

    impl<'de> Visitor<'de> for ProtoVisitor {
        type Value = u8;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an IP protocol number or name")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u8, E> {
            u8::try_from(v).map_err(|_| E::custom(format!("protocol {v} out of range")))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u8, E> {
            u8::try_from(v).map_err(|_| E::custom(format!("protocol {v} out of range")))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u8, E> {
            if let Ok(n) = v.parse::<u8>() {
                return Ok(n);
            }
            proto_from_name(v).ok_or_else(|| E::custom(format!("unknown protocol {v:?}")))
        }

        fn visit_unit<E: de::Error>(self) -> Result<u8, E> {
            Ok(0)
        }
    }

    deserializer.deserialize_any(ProtoVisitor)
}
