use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{FlowSample, TrafficClass};

/// Response body of the network-logs endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkLogs {
    pub logs: Vec<LogMessage>,
}

/// One log message uploaded by a node, covering a short time window.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogMessage {
    /// Stable node ID of the reporting node.
    pub node_id: String,
    /// When the log service accepted the message.
    pub logged: Option<DateTime<Utc>>,
    /// Start of the window covered by this message.
    pub start: Option<DateTime<Utc>>,
    /// End of the window covered by this message.
    pub end: Option<DateTime<Utc>>,
    pub virtual_traffic: Vec<FlowSample>,
    pub subnet_traffic: Vec<FlowSample>,
    pub exit_traffic: Vec<FlowSample>,
    pub physical_traffic: Vec<FlowSample>,
}

impl LogMessage {
    /// Returns the samples recorded for one traffic class.
    pub fn traffic(&self, class: TrafficClass) -> &[FlowSample] {
        match class {
            TrafficClass::Virtual => &self.virtual_traffic,
            TrafficClass::Subnet => &self.subnet_traffic,
            TrafficClass::Exit => &self.exit_traffic,
            TrafficClass::Physical => &self.physical_traffic,
        }
    }

    /// Iterates every sample in the message tagged with its traffic class.
    pub fn samples(&self) -> impl Iterator<Item = (TrafficClass, &FlowSample)> + '_ {
        TrafficClass::all()
            .iter()
            .flat_map(move |class| self.traffic(*class).iter().map(move |s| (*class, s)))
    }
}

impl NetworkLogs {
    /// Number of samples per traffic class, indexed by `TrafficClass as usize`.
    pub fn class_counts(&self) -> [usize; 4] {
        let mut counts = [0usize; 4];
        for msg in &self.logs {
            for class in TrafficClass::all() {
                counts[*class as usize] += msg.traffic(*class).len();
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"{
        "logs": [{
            "logged": "2024-05-01T10:00:05.123456789Z",
            "nodeId": "nABC123CNTRL",
            "start": "2024-05-01T10:00:00Z",
            "end": "2024-05-01T10:00:05Z",
            "virtualTraffic": [
                {"proto":6,"src":"100.1.1.1:1111","dst":"100.2.2.2:2222","txPkts":1,"txBytes":2,"rxPkts":3,"rxBytes":4}
            ],
            "exitTraffic": [
                {"proto":17,"dst":"1.1.1.1:53","txPkts":5}
            ],
            "physicalTraffic": [
                {"src":"100.1.1.1:0","dst":"203.0.113.7:41641","txPkts":9,"txBytes":900}
            ]
        }]
    }"#;

    #[test]
    fn test_decode_network_logs() {
        let logs: NetworkLogs = serde_json::from_str(BODY).expect("valid body");
        assert_eq!(logs.logs.len(), 1);

        let msg = &logs.logs[0];
        assert_eq!(msg.node_id, "nABC123CNTRL");
        assert!(msg.start.is_some());
        assert!(msg.end.is_some());
        assert_eq!(msg.virtual_traffic.len(), 1);
        assert!(msg.subnet_traffic.is_empty());
        assert_eq!(msg.exit_traffic[0].dst, "1.1.1.1:53");
    }

    #[test]
    fn test_samples_tags_each_class() {
        let logs: NetworkLogs = serde_json::from_str(BODY).expect("valid body");
        let classes: Vec<TrafficClass> = logs.logs[0].samples().map(|(c, _)| c).collect();
        assert_eq!(
            classes,
            vec![
                TrafficClass::Virtual,
                TrafficClass::Exit,
                TrafficClass::Physical
            ]
        );
    }

    #[test]
    fn test_class_counts() {
        let logs: NetworkLogs = serde_json::from_str(BODY).expect("valid body");
        assert_eq!(logs.class_counts(), [1, 0, 1, 1]);
    }

    #[test]
    fn test_empty_body() {
        let logs: NetworkLogs = serde_json::from_str("{}").expect("empty body");
        assert!(logs.logs.is_empty());
        assert_eq!(logs.class_counts(), [0; 4]);
    }
}
