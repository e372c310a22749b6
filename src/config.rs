use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Environment variable overriding `tailnet`.
pub const ENV_TAILNET: &str = "TAILNET_NAME";
/// Environment variable overriding `oauth.client_id`.
pub const ENV_CLIENT_ID: &str = "OAUTH_CLIENT_ID";
/// Environment variable overriding `oauth.client_secret`.
pub const ENV_CLIENT_SECRET: &str = "OAUTH_CLIENT_SECRET";

/// Top-level configuration for the tailflow exporter.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Tailnet whose flow logs and devices are read.
    #[serde(default)]
    pub tailnet: String,

    /// Control-plane API connection configuration.
    #[serde(default)]
    pub api: ApiConfig,

    /// OAuth client credentials.
    #[serde(default)]
    pub oauth: OAuthConfig,

    /// How often flow logs are fetched and published. Default: 45s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Look-back window of each flow-log fetch. Defaults to `poll_interval`.
    #[serde(default, with = "humantime_serde")]
    pub log_window: Option<Duration>,

    /// Device directory polling configuration.
    #[serde(default)]
    pub devices: DevicesConfig,

    /// Replace endpoint IPs with short device names in exported labels.
    #[serde(default)]
    pub resolve_names: bool,

    /// Prometheus exposition server configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Control-plane API connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API base URL. Default: "https://api.tailscale.com/api/v2".
    #[serde(default = "default_api_endpoint")]
    pub endpoint: String,

    /// Request timeout. Default: 30s.
    #[serde(default = "default_api_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// OAuth client-credentials configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    /// Token endpoint. Defaults to `{api.endpoint}/oauth/token`.
    #[serde(default)]
    pub token_url: String,
}

/// Device directory polling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DevicesConfig {
    /// How often the device directory is fetched. Default: 45s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

/// Prometheus exposition server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Listen address; ":port" binds all interfaces. Default: ":9100".
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_api_endpoint() -> String {
    "https://api.tailscale.com/api/v2".to_string()
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(45)
}

fn default_metrics_addr() -> String {
    ":9100".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            tailnet: String::new(),
            api: ApiConfig::default(),
            oauth: OAuthConfig::default(),
            poll_interval: default_poll_interval(),
            log_window: None,
            devices: DevicesConfig::default(),
            resolve_names: false,
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_api_endpoint(),
            timeout: default_api_timeout(),
        }
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            addr: default_metrics_addr(),
        }
    }
}

// --- Loading and validation ---

impl Config {
    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.apply_env(|key| std::env::var(key).ok());
        cfg.validate()?;

        Ok(cfg)
    }

    /// Build a configuration from defaults and the environment only.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();
        cfg.apply_env(|key| std::env::var(key).ok());
        cfg.validate()?;

        Ok(cfg)
    }

    /// Overrides the tailnet and credentials from non-empty variables.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get(ENV_TAILNET) {
            self.tailnet = v;
        }
        if let Some(v) = get(ENV_CLIENT_ID) {
            self.oauth.client_id = v;
        }
        if let Some(v) = get(ENV_CLIENT_SECRET) {
            self.oauth.client_secret = v;
        }
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.tailnet.is_empty() {
            bail!("tailnet is required (or set {ENV_TAILNET})");
        }

        if self.oauth.client_id.is_empty() {
            bail!("oauth.client_id is required (or set {ENV_CLIENT_ID})");
        }

        if self.oauth.client_secret.is_empty() {
            bail!("oauth.client_secret is required (or set {ENV_CLIENT_SECRET})");
        }

        if self.api.endpoint.is_empty() {
            bail!("api.endpoint is required");
        }

        if self.poll_interval.is_zero() {
            bail!("poll_interval must be positive");
        }

        if self.log_window.is_some_and(|w| w.is_zero()) {
            bail!("log_window must be positive");
        }

        if self.devices.poll_interval.is_zero() {
            bail!("devices.poll_interval must be positive");
        }

        if self.metrics.addr.is_empty() {
            bail!("metrics.addr is required");
        }

        Ok(())
    }

    /// Effective flow-log fetch window.
    pub fn log_window(&self) -> Duration {
        self.log_window.unwrap_or(self.poll_interval)
    }
}

impl ApiConfig {
    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }
}

impl Config {
    /// Effective OAuth token endpoint.
    pub fn token_url(&self) -> String {
        if self.oauth.token_url.is_empty() {
            format!("{}/oauth/token", self.api.base_url())
        } else {
            self.oauth.token_url.clone()
        }
    }
}
