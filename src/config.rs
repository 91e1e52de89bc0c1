//! Configuration for llmlaunch

use crate::loadgen::ArrivalDistribution;
use crate::probe::Environment;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// API server launch options
    #[serde(default)]
    pub server: ServerConfig,

    /// Backing resource cluster (Ray) options
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Readiness polling options
    #[serde(default)]
    pub readiness: ReadinessConfig,

    /// Environment discovery options
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Benchmark to run once the server is ready (None = no benchmark)
    #[serde(default)]
    pub benchmark: Option<BenchmarkConfig>,

    /// Write rendered Prometheus metrics here when the run finishes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_file: Option<PathBuf>,
}

/// How to start the API server.
///
/// ```json
/// {
///   "model_path": "/mnt/model/Qwen-7B",
///   "draft_model_path": "/mnt/model/Qwen-0.5B",
///   "port": 8000
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Program used to start the API server
    #[serde(default = "default_server_command")]
    pub command: String,

    /// Arguments placed before the generated options (e.g. `-m <module>`)
    #[serde(default = "default_entrypoint_args")]
    pub entrypoint_args: Vec<String>,

    /// Address the server binds to (default: discovered local address)
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Path to the model (HuggingFace model ID or local path)
    #[serde(default)]
    pub model_path: String,

    /// Draft model for speculative decoding. Speculative flags are only
    /// passed when this is set.
    #[serde(default)]
    pub draft_model_path: Option<String>,

    #[serde(default = "default_max_model_len")]
    pub max_model_len: u32,

    /// Number of serving instances (default: detected accelerator count)
    #[serde(default)]
    pub initial_instances: Option<u32>,

    #[serde(default = "default_num_speculative_tokens")]
    pub num_speculative_tokens: u32,

    #[serde(default = "default_true")]
    pub use_v2_block_manager: bool,

    /// Run the engine as a cluster actor
    #[serde(default = "default_true")]
    pub engine_use_cluster: bool,

    /// Run the workers as cluster actors
    #[serde(default = "default_true")]
    pub worker_use_cluster: bool,

    /// Additional server CLI arguments appended after the generated ones
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Extra environment variables for the server process
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: default_server_command(),
            entrypoint_args: default_entrypoint_args(),
            host: None,
            port: default_server_port(),
            model_path: String::new(),
            draft_model_path: None,
            max_model_len: default_max_model_len(),
            initial_instances: None,
            num_speculative_tokens: default_num_speculative_tokens(),
            use_v2_block_manager: true,
            engine_use_cluster: true,
            worker_use_cluster: true,
            extra_args: vec![],
            env: HashMap::new(),
        }
    }
}

/// Backing cluster configuration.
///
/// A head node starts the cluster itself; a worker node joins the cluster
/// at `head_address`, retrying until the head is up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Start and stop the cluster around the server (false = server only)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cluster manager binary (default: "ray" on PATH)
    #[serde(default = "default_cluster_command")]
    pub command: String,

    #[serde(default = "default_cluster_port")]
    pub port: u16,

    /// Join an existing cluster instead of starting a head node
    #[serde(default)]
    pub worker: bool,

    /// Head node address (required for worker nodes)
    #[serde(default)]
    pub head_address: Option<String>,

    /// Attempts to join the head node before giving up (worker nodes only)
    #[serde(default = "default_start_attempts")]
    pub start_attempts: u32,

    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_cluster_command(),
            port: default_cluster_port(),
            worker: false,
            head_address: None,
            start_attempts: default_start_attempts(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl ClusterConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Readiness polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    /// Path of the readiness endpoint on the API server
    #[serde(default = "default_readiness_path")]
    pub path: String,

    /// Give up after this many seconds
    #[serde(default = "default_readiness_timeout")]
    pub timeout_secs: u64,

    /// Delay between probes in milliseconds
    #[serde(default = "default_readiness_interval_ms")]
    pub interval_ms: u64,

    /// Timeout for a single probe request in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            path: default_readiness_path(),
            timeout_secs: default_readiness_timeout(),
            interval_ms: default_readiness_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl ReadinessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Environment discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Device inventory query; one output line per accelerator
    #[serde(default = "default_device_query")]
    pub device_query: Vec<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            device_query: default_device_query(),
        }
    }
}

/// Benchmark (load generator) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    #[serde(default = "default_num_requests")]
    pub num_requests: usize,

    /// Target arrival rate in requests per second (`inf` = all at once)
    #[serde(default = "default_qps")]
    pub qps: f64,

    #[serde(default)]
    pub distribution: ArrivalDistribution,

    /// Abort the whole run on the first failed request
    #[serde(default)]
    pub fail_fast: bool,

    /// Path of the generation endpoint on the API server
    #[serde(default = "default_benchmark_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Prompt used when no dataset is configured
    #[serde(default = "default_prompt")]
    pub prompt: String,

    /// Seed for the arrival process (None = random)
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub dataset: Option<DatasetConfig>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            num_requests: default_num_requests(),
            qps: default_qps(),
            distribution: ArrivalDistribution::default(),
            fail_fast: false,
            endpoint: default_benchmark_endpoint(),
            request_timeout_secs: default_request_timeout(),
            max_tokens: default_max_tokens(),
            prompt: default_prompt(),
            seed: None,
            dataset: None,
        }
    }
}

impl BenchmarkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Benchmark dataset in ShareGPT format, downloaded on first use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Local path; downloaded from `url` if missing
    pub path: PathBuf,

    #[serde(default = "default_dataset_url")]
    pub url: String,

    /// Use at most this many prompts
    #[serde(default)]
    pub max_prompts: Option<usize>,
}

fn default_server_command() -> String {
    "python".to_string()
}

fn default_entrypoint_args() -> Vec<String> {
    vec![
        "-m".to_string(),
        "llumnix.entrypoints.vllm.api_server".to_string(),
    ]
}

fn default_server_port() -> u16 {
    8000
}

fn default_max_model_len() -> u32 {
    4096
}

fn default_num_speculative_tokens() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_cluster_command() -> String {
    "ray".to_string()
}

fn default_cluster_port() -> u16 {
    6379
}

fn default_start_attempts() -> u32 {
    30
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_readiness_path() -> String {
    "/is_ready".to_string()
}

fn default_readiness_timeout() -> u64 {
    180
}

fn default_readiness_interval_ms() -> u64 {
    1000
}

fn default_probe_timeout_ms() -> u64 {
    1000
}

fn default_device_query() -> Vec<String> {
    vec![
        "nvidia-smi".to_string(),
        "--query-gpu=index".to_string(),
        "--format=csv,noheader".to_string(),
    ]
}

fn default_num_requests() -> usize {
    100
}

fn default_qps() -> f64 {
    2.0
}

fn default_benchmark_endpoint() -> String {
    "/generate".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_tokens() -> u32 {
    128
}

fn default_prompt() -> String {
    "San Francisco is a".to_string()
}

fn default_dataset_url() -> String {
    "https://huggingface.co/datasets/anon8231489123/ShareGPT_Vicuna_unfiltered/resolve/main/ShareGPT_V3_unfiltered_cleaned_split.json".to_string()
}

impl Config {
    /// Load configuration from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Reject configurations that cannot produce a working launch, and warn
    /// about ones that probably will not do what was intended.
    pub fn validate(&self) -> Result<()> {
        use tracing::warn;

        if self.server.model_path.trim().is_empty() {
            bail!("server.model_path must be set");
        }
        if self.server.port == 0 {
            bail!("server.port must be non-zero");
        }
        if self.server.initial_instances == Some(0) {
            bail!("server.initial_instances must be at least 1");
        }
        if self.server.draft_model_path.is_some() && self.server.num_speculative_tokens == 0 {
            bail!("server.num_speculative_tokens must be at least 1 when a draft model is set");
        }
        if self.server.draft_model_path.is_some() && !self.server.use_v2_block_manager {
            warn!("Speculative decoding is configured without the v2 block manager");
        }

        if self.cluster.enabled {
            if self.cluster.port == 0 {
                bail!("cluster.port must be non-zero");
            }
            if self.cluster.worker && self.cluster.head_address.is_none() {
                bail!("cluster.head_address is required for worker nodes");
            }
            if self.cluster.worker && self.cluster.start_attempts == 0 {
                bail!("cluster.start_attempts must be at least 1");
            }
        } else if self.server.engine_use_cluster || self.server.worker_use_cluster {
            warn!(
                "Cluster launch is disabled but the server expects a cluster; \
                 an external cluster must already be running"
            );
        }

        if self.readiness.interval_ms == 0 {
            bail!("readiness.interval_ms must be non-zero");
        }
        if !self.readiness.path.starts_with('/') {
            bail!("readiness.path must start with '/'");
        }
        if self.readiness.probe_timeout_ms > self.readiness.interval_ms {
            warn!(
                probe_timeout_ms = self.readiness.probe_timeout_ms,
                interval_ms = self.readiness.interval_ms,
                "Readiness probe timeout exceeds the polling interval"
            );
        }

        if self.probe.device_query.is_empty() {
            bail!("probe.device_query must name a command");
        }

        if let Some(ref benchmark) = self.benchmark {
            if benchmark.num_requests == 0 {
                bail!("benchmark.num_requests must be at least 1");
            }
            if benchmark.qps.is_nan() || benchmark.qps <= 0.0 {
                bail!("benchmark.qps must be positive, got {}", benchmark.qps);
            }
            if Duration::try_from_secs_f64(1.0 / benchmark.qps).is_err() {
                bail!("benchmark.qps is too small, got {}", benchmark.qps);
            }
            if !benchmark.endpoint.starts_with('/') {
                bail!("benchmark.endpoint must start with '/'");
            }
            if benchmark.request_timeout_secs == 0 {
                bail!("benchmark.request_timeout_secs must be non-zero");
            }
        }

        Ok(())
    }

    /// Resolve the immutable launch parameters from this config and the
    /// discovered environment.
    pub fn launch_config(&self, env: &Environment) -> LaunchConfig {
        let server = &self.server;
        LaunchConfig {
            host: server
                .host
                .clone()
                .unwrap_or_else(|| env.local_address.to_string()),
            port: server.port,
            node_address: env.local_address,
            model_path: server.model_path.clone(),
            draft_model_path: server.draft_model_path.clone(),
            max_model_len: server.max_model_len,
            initial_instances: server
                .initial_instances
                .unwrap_or(env.accelerator_count),
            num_speculative_tokens: server.num_speculative_tokens,
            use_v2_block_manager: server.use_v2_block_manager,
            engine_use_cluster: server.engine_use_cluster,
            worker_use_cluster: server.worker_use_cluster,
        }
    }
}

/// Resolved launch parameters, built once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    pub host: String,
    pub port: u16,
    /// Address this node advertises to the cluster
    pub node_address: IpAddr,
    pub model_path: String,
    pub draft_model_path: Option<String>,
    pub max_model_len: u32,
    pub initial_instances: u32,
    pub num_speculative_tokens: u32,
    pub use_v2_block_manager: bool,
    pub engine_use_cluster: bool,
    pub worker_use_cluster: bool,
}

impl LaunchConfig {
    /// Build the API server option list.
    ///
    /// Speculative-decoding options are only emitted when a draft model is
    /// configured.
    pub fn server_args(&self) -> Vec<String> {
        let mut args = vec![
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--initial-instances".to_string(),
            self.initial_instances.to_string(),
            "--model".to_string(),
            self.model_path.clone(),
            "--max-model-len".to_string(),
            self.max_model_len.to_string(),
        ];

        if let Some(ref draft) = self.draft_model_path {
            args.extend([
                "--speculative-model".to_string(),
                draft.clone(),
                "--num-speculative-tokens".to_string(),
                self.num_speculative_tokens.to_string(),
            ]);
        }
        if self.use_v2_block_manager {
            args.push("--use-v2-block-manager".to_string());
        }
        if self.engine_use_cluster {
            args.push("--engine-use-ray".to_string());
        }
        if self.worker_use_cluster {
            args.push("--worker-use-ray".to_string());
        }

        args
    }

    /// Base URL clients use to reach the server. A wildcard bind address is
    /// reached through loopback.
    pub fn base_url(&self) -> String {
        let host = match self.host.parse::<IpAddr>() {
            Ok(ip) if ip.is_unspecified() => "127.0.0.1".to_string(),
            Ok(IpAddr::V6(ip)) => format!("[{}]", ip),
            _ => self.host.clone(),
        };
        format!("http://{}:{}", host, self.port)
    }

    pub fn is_speculative(&self) -> bool {
        self.draft_model_path.is_some()
    }
}
