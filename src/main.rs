use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use tailflow::agent::Agent;
use tailflow::config::Config;

/// Exports Tailscale network flow logs as Prometheus counters.
#[derive(Parser)]
#[command(name = "tailflow", about)]
struct Cli {
    /// Path to the YAML configuration file. Without it, defaults and the
    /// TAILNET_NAME / OAUTH_CLIENT_ID / OAUTH_CLIENT_SECRET variables are used.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override the metrics listen address (e.g. ":9100").
    #[arg(long)]
    addr: Option<String>,

    /// Replace endpoint IPs with short device names.
    #[arg(long)]
    resolve_names: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("tailflow {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::from_env().context("building config from environment")?,
    };

    if let Some(addr) = cli.addr {
        cfg.metrics.addr = addr;
    }
    if cli.resolve_names {
        cfg.resolve_names = true;
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting tailflow",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for SIGINT")?;
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<Result<()>>();

    tokio::spawn(async move {
        let _ = shutdown_tx.send(shutdown_signal().await);
    });

    let mut agent = Agent::new(cfg)?;
    if let Err(e) = agent.start().await {
        agent.stop().await?;
        return Err(e);
    }

    let signal = shutdown_rx.await.context("signal handler exited")?;

    agent.stop().await?;
    signal?;

    tracing::info!("tailflow stopped");

    Ok(())
}
