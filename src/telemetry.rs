//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase using the `metrics` crate's
//! macros. This module installs the Prometheus recorder and registers
//! human-readable descriptions for each metric. There is no scrape endpoint:
//! the rendered text is written to a file when the launch finishes.

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::Path;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests that
/// share a process). Metric recording still works: the `metrics` macros
/// route to whichever recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

/// Render the current metrics to `path` in Prometheus text format.
pub async fn write_snapshot(handle: &PrometheusHandle, path: &Path) -> Result<()> {
    tokio::fs::write(path, handle.render())
        .await
        .with_context(|| format!("Failed to write metrics file: {}", path.display()))
}

fn describe() {
    describe_histogram!(
        "llmlaunch_phase_duration_seconds",
        "Time spent in each supervisor phase (starting, waiting, benchmarking, stopping)"
    );
    describe_counter!(
        "llmlaunch_readiness_probes_total",
        "Readiness probes issued, by result"
    );

    // -- Benchmark --
    describe_counter!(
        "llmlaunch_benchmark_requests_total",
        "Completed benchmark requests, by result"
    );
    describe_histogram!(
        "llmlaunch_benchmark_request_duration_seconds",
        "End-to-end benchmark request latency"
    );

    describe_counter!(
        "llmlaunch_teardown_failures_total",
        "Teardown steps that failed (logged, never fatal)"
    );
}
