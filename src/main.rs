//! llmlaunch - launch orchestrator for distributed LLM serving
//!
//! Starts the Ray cluster and the API server sized to the local
//! accelerators, waits for readiness, optionally runs a benchmark, and
//! always tears the cluster down before exiting.

use anyhow::{Context, Result};
use clap::Parser;
use llmlaunch::{ArrivalDistribution, Config, EnvironmentProber, LifecycleSupervisor};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "llmlaunch")]
#[command(about = "Launch, health-check, benchmark and tear down an LLM serving cluster")]
struct Args {
    /// Path to configuration file (optional when --model is given)
    #[arg(short, long, env = "LLMLAUNCH_CONFIG")]
    config: Option<PathBuf>,

    /// Model path (overrides config)
    #[arg(short, long, env = "LLMLAUNCH_MODEL")]
    model: Option<String>,

    /// Draft model path; enables speculative decoding
    #[arg(long, env = "LLMLAUNCH_DRAFT_MODEL")]
    draft_model: Option<String>,

    /// API server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Number of serving instances (default: detected accelerator count)
    #[arg(long)]
    instances: Option<u32>,

    /// Seconds to wait for the server to become ready
    #[arg(long, value_name = "SECS")]
    readiness_timeout: Option<u64>,

    /// Run a benchmark once the server is ready
    #[arg(long)]
    benchmark: bool,

    /// Benchmark arrival rate in requests per second (implies --benchmark)
    #[arg(long)]
    qps: Option<f64>,

    /// Number of benchmark requests (implies --benchmark)
    #[arg(long)]
    num_requests: Option<usize>,

    /// Arrival distribution: poisson or uniform (implies --benchmark)
    #[arg(long)]
    distribution: Option<ArrivalDistribution>,

    /// Abort the benchmark on the first failed request (implies --benchmark)
    #[arg(long)]
    fail_fast: bool,

    /// Join the cluster at this head node address
    #[arg(long, env = "LLMLAUNCH_HEAD_ADDRESS")]
    head_address: Option<String>,

    /// Run as a worker node (requires a head address)
    #[arg(long)]
    worker: bool,

    /// Do not start or stop the Ray cluster
    #[arg(long)]
    no_cluster: bool,

    /// Write Prometheus metrics to this file when the run finishes
    #[arg(long)]
    metrics_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn wants_benchmark(&self) -> bool {
        self.benchmark
            || self.qps.is_some()
            || self.num_requests.is_some()
            || self.distribution.is_some()
            || self.fail_fast
    }

    fn apply(&self, config: &mut Config) {
        if let Some(ref model) = self.model {
            config.server.model_path = model.clone();
        }
        if let Some(ref draft) = self.draft_model {
            config.server.draft_model_path = Some(draft.clone());
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(instances) = self.instances {
            config.server.initial_instances = Some(instances);
        }
        if let Some(timeout) = self.readiness_timeout {
            config.readiness.timeout_secs = timeout;
        }

        if self.wants_benchmark() {
            let bench = config.benchmark.get_or_insert_with(Default::default);
            if let Some(qps) = self.qps {
                bench.qps = qps;
            }
            if let Some(n) = self.num_requests {
                bench.num_requests = n;
            }
            if let Some(distribution) = self.distribution {
                bench.distribution = distribution;
            }
            if self.fail_fast {
                bench.fail_fast = true;
            }
        }

        if let Some(ref head) = self.head_address {
            config.cluster.head_address = Some(head.clone());
        }
        if self.worker {
            config.cluster.worker = true;
        }
        if self.no_cluster {
            config.cluster.enabled = false;
        }
        if let Some(ref path) = self.metrics_file {
            config.metrics_file = Some(path.clone());
        }
    }
}

async fn load_config(args: &Args) -> Result<Config> {
    let mut config = match args.config {
        Some(ref path) => Config::from_file(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Forward SIGINT/SIGTERM to the supervisor until the process exits.
///
/// The handlers are registered before this returns, so a signal arriving
/// while the cluster starts still reaches the supervisor.
fn spawn_signal_handler(supervisor: Arc<LifecycleSupervisor>) {
    use tokio::signal::unix::{SignalKind, signal};

    match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(mut sigint), Ok(mut sigterm)) => {
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = sigint.recv() => info!("Received SIGINT"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                    }
                    supervisor.interrupt();
                }
            });
        }
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Failed to install signal handlers, falling back to Ctrl+C");
            tokio::spawn(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    supervisor.interrupt();
                }
            });
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging.
    // API server output is logged under the "server" target and cluster CLI
    // output under "cluster", both at debug level.
    let filter = if args.verbose {
        EnvFilter::new("llmlaunch=debug,server=debug,cluster=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config = match load_config(&args).await {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(2);
        }
    };

    let metrics = llmlaunch::telemetry::install();

    let env = EnvironmentProber::new(&config.probe).discover().await;
    let (supervisor, launch) = match llmlaunch::build_supervisor(&config, &env).await {
        Ok(built) => built,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(1);
        }
    };

    let supervisor = Arc::new(supervisor);
    spawn_signal_handler(supervisor.clone());

    let outcome = supervisor.run(&launch).await;

    if let Some(ref run) = outcome.benchmark {
        println!();
        println!("{}", run.summary());
    }

    if let (Some(handle), Some(path)) = (metrics.as_ref(), config.metrics_file.as_ref())
        && let Err(e) = llmlaunch::telemetry::write_snapshot(handle, path).await
    {
        warn!("{:#}", e);
    }

    ExitCode::from(outcome.exit_code() as u8)
}
