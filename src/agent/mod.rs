use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::aggregate::AggregationStore;
use crate::api;
use crate::collector::{DeviceCollector, FlowCollector};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::resolve::Resolver;

/// Agent wires the API client, collectors, and metrics server together.
pub struct Agent {
    cfg: Config,
    metrics: Arc<Metrics>,
    store: Arc<AggregationStore>,
    resolver: Option<Arc<Resolver>>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, registering all metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let metrics = Arc::new(Metrics::new(&cfg.metrics.addr).context("creating metrics")?);
        let resolver = cfg.resolve_names.then(|| Arc::new(Resolver::new()));

        Ok(Self {
            cfg,
            metrics,
            store: Arc::new(AggregationStore::new()),
            resolver,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Start the metrics server and both collection loops.
    ///
    /// With name resolution enabled the first name map is built before any
    /// loop starts; failing to build it aborts startup.
    pub async fn start(&mut self) -> Result<()> {
        self.metrics
            .start()
            .await
            .context("starting metrics server")?;

        let client = Arc::new(self.create_api_client()?);

        let mut devices = DeviceCollector::new(
            Arc::clone(&client),
            Arc::clone(&self.metrics),
            self.cfg.devices.poll_interval,
        );
        let mut flows = FlowCollector::new(
            Arc::clone(&client),
            Arc::clone(&self.store),
            Arc::clone(&self.metrics),
            self.cfg.poll_interval,
            self.cfg.log_window(),
        );

        let mut initial_done = false;
        if let Some(resolver) = &self.resolver {
            devices = devices.with_resolver(Arc::clone(resolver));
            flows = flows.with_resolver(Arc::clone(resolver));

            let count = devices
                .refresh_once()
                .await
                .context("building initial name map")?;
            info!(devices = count, "built initial name map");
            initial_done = true;
        }

        self.tasks
            .push(tokio::spawn(devices.run(self.cancel.child_token(), initial_done)));
        self.tasks
            .push(tokio::spawn(flows.run(self.cancel.child_token())));

        info!(
            tailnet = %self.cfg.tailnet,
            resolve_names = self.cfg.resolve_names,
            "agent fully started"
        );

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        // Wait for the loops; the flow loop publishes what it still holds.
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "collector task failed");
            }
        }

        self.metrics.stop().await?;

        Ok(())
    }

    /// Create an API client with metrics callback.
    fn create_api_client(&self) -> Result<api::Client> {
        let client = api::Client::new(&self.cfg).context("creating API client")?;
        Ok(client.with_metrics(self.metrics.api_callback()))
    }
}
