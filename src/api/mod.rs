//! Tailscale control-plane API client.

pub mod devices;
pub mod oauth;

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::Config;
use crate::flow::NetworkLogs;

pub use self::devices::Device;
pub use self::oauth::TokenSource;

use self::devices::DevicesResponse;

/// Timestamp layout accepted by the network-logs endpoint.
const LOG_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9fZ";

/// Callback type for recording API request metrics.
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Time range of one flow-log fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl LogWindow {
    /// Window of the given length ending at `end`.
    pub fn ending_at(end: DateTime<Utc>, length: Duration) -> Result<Self> {
        let length = chrono::Duration::from_std(length)
            .with_context(|| format!("log window {length:?} out of range"))?;

        Ok(Self {
            start: end - length,
            end,
        })
    }

    /// Window of the given length ending now.
    pub fn last(length: Duration) -> Result<Self> {
        Self::ending_at(Utc::now(), length)
    }

    fn query(&self) -> [(&'static str, String); 2] {
        [
            ("start", self.start.format(LOG_TIME_FORMAT).to_string()),
            ("end", self.end.format(LOG_TIME_FORMAT).to_string()),
        ]
    }
}

/// Source of network flow logs.
pub trait FlowLogSource: Send + Sync {
    /// Fetch every log message recorded within the window.
    fn fetch_logs(&self, window: LogWindow) -> impl Future<Output = Result<NetworkLogs>> + Send;
}

/// Source of the tailnet device directory.
pub trait DeviceSource: Send + Sync {
    /// Fetch the current device list.
    fn fetch_devices(&self) -> impl Future<Output = Result<Vec<Device>>> + Send;
}

/// HTTP client for the tailnet-scoped API endpoints.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    tailnet: String,
    tokens: TokenSource,
    metrics: Option<MetricsCallback>,
}

impl Client {
    /// Create a new API client.
    pub fn new(cfg: &Config) -> Result<Self> {
        let timeout = if cfg.api.timeout.is_zero() {
            Duration::from_secs(30)
        } else {
            cfg.api.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        let tokens = TokenSource::new(
            cfg.token_url(),
            cfg.oauth.client_id.clone(),
            cfg.oauth.client_secret.clone(),
        );

        Ok(Self {
            http,
            endpoint: cfg.api.base_url().to_string(),
            tailnet: cfg.tailnet.clone(),
            tokens,
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    /// The callback receives (endpoint_name, status, duration).
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, endpoint: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(endpoint, status, duration);
        }
    }

    fn tailnet_path(&self, resource: &str) -> String {
        format!("/tailnet/{}/{}", self.tailnet, resource)
    }

    /// Perform an authenticated GET request and deserialize the JSON response.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let start = Instant::now();
        let endpoint = endpoint_from_path(path);
        let url = format!("{}{}", self.endpoint, path);

        let token = match self.tokens.token(&self.http).await {
            Ok(token) => token,
            Err(e) => {
                self.record_request(endpoint, "auth_error", start.elapsed());
                return Err(e);
            }
        };

        let response = self
            .http
            .get(&url)
            .query(query)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.record_request(endpoint, "error", start.elapsed());
                return Err(e).with_context(|| format!("requesting {path}"));
            }
        };

        let status_code = response.status();

        if !status_code.is_success() {
            if status_code == reqwest::StatusCode::UNAUTHORIZED {
                self.tokens.invalidate();
            }
            let body = response.text().await.unwrap_or_default();
            self.record_request(endpoint, "error", start.elapsed());
            bail!("unexpected status {} from {}: {}", status_code, path, body);
        }

        let result: Result<T> = response
            .json()
            .await
            .with_context(|| format!("decoding response from {path}"));

        let status = if result.is_ok() { "success" } else { "decode_error" };
        self.record_request(endpoint, status, start.elapsed());

        result
    }
}

/// Extract a short endpoint name from an API path.
fn endpoint_from_path(path: &str) -> &'static str {
    if path.ends_with("/network-logs") {
        "network_logs"
    } else if path.ends_with("/devices") {
        "devices"
    } else {
        "other"
    }
}

impl FlowLogSource for Client {
    async fn fetch_logs(&self, window: LogWindow) -> Result<NetworkLogs> {
        debug!(start = %window.start, end = %window.end, "fetching network logs");

        let path = self.tailnet_path("network-logs");
        let logs: NetworkLogs = self
            .get_json(&path, &window.query())
            .await
            .context("fetching network logs")?;

        Ok(logs)
    }
}

impl DeviceSource for Client {
    async fn fetch_devices(&self) -> Result<Vec<Device>> {
        debug!("fetching tailnet devices");

        let path = self.tailnet_path("devices");
        let resp: DevicesResponse = self
            .get_json(&path, &[])
            .await
            .context("fetching devices")?;

        Ok(resp.devices)
    }
}
