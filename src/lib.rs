//! # llmlaunch
//!
//! Launch orchestrator for distributed LLM serving: sizes the instance pool
//! from the local accelerators, starts the backing Ray cluster and the API
//! server, waits for readiness, optionally benchmarks the server, and tears
//! everything down on exit or interrupt.
//!
//! This crate provides:
//! - **Prober**: discovers the local address and accelerator count
//! - **Controller**: starts/stops the cluster and the API server process group
//! - **Readiness gate**: polls `/is_ready` with a bounded timeout
//! - **Load generator**: Poisson/uniform open-loop benchmark client
//! - **Supervisor**: state machine with a single teardown path
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ LifecycleSupervisor                                          │
//! │   Idle → Starting → Waiting → (Benchmarking) → Stopping → Done│
//! │                                                              │
//! │  ┌───────────────┐   ┌────────────────┐   ┌───────────────┐  │
//! │  │ Environment   │──▶│ Cluster        │   │ Readiness     │  │
//! │  │ Prober        │   │ Controller     │   │ Gate          │  │
//! │  │ addr, #GPUs   │   │ ray + server   │   │ GET /is_ready │  │
//! │  └───────────────┘   └───────┬────────┘   └───────┬───────┘  │
//! │                              │                    │          │
//! │                      ┌───────▼────────────────────▼───────┐  │
//! │                      │ API server (own process group)     │  │
//! │                      └───────▲────────────────────────────┘  │
//! │                              │ POST /generate                │
//! │                      ┌───────┴────────┐                      │
//! │                      │ Load Generator │                      │
//! │                      └────────────────┘                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod controller;
pub mod loadgen;
pub mod probe;
pub mod readiness;
pub mod supervisor;
pub mod telemetry;
pub mod types;

pub use config::{Config, LaunchConfig};
pub use controller::{ClusterController, ClusterHandle, HandleState, ProcessController};
pub use loadgen::{
    ArrivalDistribution, BenchmarkRun, BenchmarkSummary, HttpSender, LoadGenerator,
    RequestRecord, RequestSender,
};
pub use probe::{Environment, EnvironmentProber};
pub use readiness::{HttpProbe, ReadinessGate, ReadinessProbe};
pub use supervisor::{BenchmarkPlan, LaunchOutcome, LifecycleSupervisor};
pub use types::{LaunchError, ReadinessResult, SupervisorState};

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Build the complete launch stack for `config` on the discovered
/// environment.
///
/// Benchmark prompts (including a dataset download) are resolved here, before
/// anything is started.
pub async fn build_supervisor(
    config: &Config,
    env: &Environment,
) -> Result<(LifecycleSupervisor, Arc<LaunchConfig>)> {
    let launch = Arc::new(config.launch_config(env));
    info!(
        host = %launch.host,
        port = launch.port,
        instances = launch.initial_instances,
        speculative = launch.is_speculative(),
        cluster = config.cluster.enabled,
        "Building launch"
    );

    let controller = Arc::new(ProcessController::new(
        config.server.clone(),
        &config.cluster,
    ));
    let probe = Arc::new(HttpProbe::new(
        &launch.base_url(),
        &config.readiness.path,
        config.readiness.probe_timeout(),
    ));

    let benchmark = match config.benchmark {
        Some(ref bench) => {
            let client = reqwest::Client::new();
            let prompts = match bench.dataset {
                Some(ref dataset) => loadgen::dataset::load_prompts(dataset, &client)
                    .await
                    .context("Failed to prepare benchmark dataset")?,
                None => vec![bench.prompt.clone()],
            };
            let sender = Arc::new(HttpSender::new(
                client,
                &launch.base_url(),
                &bench.endpoint,
                bench.max_tokens,
                bench.request_timeout(),
            ));
            Some(BenchmarkPlan {
                generator: LoadGenerator::new(sender, prompts)
                    .with_fail_fast(bench.fail_fast)
                    .with_seed(bench.seed),
                request_count: bench.num_requests,
                rate: bench.qps,
                distribution: bench.distribution,
            })
        }
        None => None,
    };

    let supervisor = LifecycleSupervisor::new(controller, probe, config.readiness.timeout())
        .with_gate(ReadinessGate::new(config.readiness.interval()))
        .with_benchmark(benchmark);

    Ok((supervisor, launch))
}
