//! Prometheus exposition for the pool metrics
//!
//! The key-pool crate emits through the `metrics` facade; this module installs
//! the recorder that turns them into Prometheus text for the `metrics` command.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return a handle for rendering.
///
/// Must run before the pool is built so the initial state gauges are captured.
pub fn install_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}
