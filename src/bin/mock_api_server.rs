//! Mock API server for testing llmlaunch
//!
//! Accepts the same options the launcher passes to the real serving
//! framework, plus a few knobs to simulate slow startup and failures:
//!
//! `mock-api-server --host 127.0.0.1 --port 8000 --initial-instances 4 --model m --ready-delay-ms 500`

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, info};

#[derive(Parser, Debug, Clone)]
#[command(name = "mock-api-server")]
#[command(about = "Mock LLM API server for testing")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, default_value = "8000")]
    port: u16,

    #[arg(long, default_value = "1")]
    initial_instances: u32,

    #[arg(long, default_value = "test-model")]
    model: String,

    #[arg(long)]
    speculative_model: Option<String>,

    #[arg(long)]
    num_speculative_tokens: Option<u32>,

    /// Max model length (ignored in mock)
    #[arg(long)]
    max_model_len: Option<u32>,

    /// Accepted for compatibility, ignored
    #[arg(long)]
    use_v2_block_manager: bool,

    /// Accepted for compatibility, ignored
    #[arg(long)]
    engine_use_ray: bool,

    /// Accepted for compatibility, ignored
    #[arg(long)]
    worker_use_ray: bool,

    /// Artificial latency for /generate (ms)
    #[arg(long, default_value = "50")]
    latency_ms: u64,

    /// /is_ready returns 503 until this long after startup (ms)
    #[arg(long, default_value = "0")]
    ready_delay_ms: u64,

    /// Never report ready
    #[arg(long)]
    never_ready: bool,

    /// Fail every Nth /generate request with a 500 (0 = never)
    #[arg(long, default_value = "0")]
    fail_every: u64,
}

struct MockState {
    args: Args,
    started: Instant,
    request_count: AtomicU64,
    failed_count: AtomicU64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_api_server=debug")
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let state = Arc::new(MockState {
        args: args.clone(),
        started: Instant::now(),
        request_count: AtomicU64::new(0),
        failed_count: AtomicU64::new(0),
    });

    let app = Router::new()
        .route("/is_ready", get(is_ready))
        .route("/generate", post(generate))
        .route("/stats", get(stats))
        .with_state(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr).await?;

    // Get the actual port (important when port=0 for dynamic allocation)
    let actual_port = listener.local_addr()?.port();

    info!(
        model = %args.model,
        port = actual_port,
        instances = args.initial_instances,
        speculative_model = ?args.speculative_model,
        "Mock API server listening"
    );

    // Signal readiness to stdout for test harness
    // Format: "READY <port>" on its own line
    println!("READY {}", actual_port);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn is_ready(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    let delay = Duration::from_millis(state.args.ready_delay_ms);
    if state.args.never_ready || state.started.elapsed() < delay {
        debug!("Readiness check: still starting");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

#[derive(Deserialize)]
struct GenerateRequest {
    prompt: String,
    #[serde(default)]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct GenerateResponse {
    text: Vec<String>,
}

async fn generate(
    State(state): State<Arc<MockState>>,
    Json(request): Json<GenerateRequest>,
) -> impl IntoResponse {
    let n = state.request_count.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::time::sleep(Duration::from_millis(state.args.latency_ms)).await;

    if state.args.fail_every > 0 && n % state.args.fail_every == 0 {
        state.failed_count.fetch_add(1, Ordering::SeqCst);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "injected failure" })),
        )
            .into_response();
    }

    let tokens = request.max_tokens.unwrap_or(16);
    let text = format!("{} [mock completion, {} tokens]", request.prompt, tokens);
    Json(GenerateResponse { text: vec![text] }).into_response()
}

async fn stats(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "model": state.args.model,
        "initial_instances": state.args.initial_instances,
        "speculative_model": state.args.speculative_model,
        "num_speculative_tokens": state.args.num_speculative_tokens,
        "request_count": state.request_count.load(Ordering::SeqCst),
        "failed_count": state.failed_count.load(Ordering::SeqCst),
    }))
}
