//! Polls the Tailscale network-logs API, aggregates per-flow counters, and
//! publishes them as Prometheus counters.

pub mod agent;
pub mod aggregate;
pub mod api;
pub mod collector;
pub mod config;
pub mod flow;
pub mod metrics;
pub mod resolve;
