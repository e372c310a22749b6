use serde::Deserialize;

/// Response body of the devices endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct DevicesResponse {
    pub devices: Vec<Device>,
}

/// A device (node) registered in the tailnet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub node_id: String,
    /// Fully qualified MagicDNS name, e.g. `laptop.tail1234.ts.net`.
    pub name: String,
    /// OS-reported hostname.
    pub hostname: String,
    /// Tailnet addresses assigned to the device.
    pub addresses: Vec<String>,
    pub os: String,
    pub user: String,
    pub client_version: String,
    pub update_available: bool,
    /// Shared in from another tailnet.
    pub is_external: bool,
    pub tags: Vec<String>,
}

impl Device {
    /// Label values for the host inventory gauge, in registration order.
    pub fn host_labels(&self) -> [String; 6] {
        [
            self.hostname.clone(),
            self.update_available.to_string(),
            self.os.clone(),
            self.is_external.to_string(),
            self.user.clone(),
            self.client_version.clone(),
        ]
    }
}
