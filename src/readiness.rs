//! Readiness gate: polls a probe until it succeeds or a deadline passes.

use crate::types::ReadinessResult;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A single readiness check. Any error counts as "not ready".
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self) -> bool;

    /// Human-readable target, used in logs and errors
    fn endpoint(&self) -> String;
}

/// `GET <url>`; ready on any 2xx.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(base_url: &str, path: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}{}", base_url.trim_end_matches('/'), path),
            timeout,
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn is_ready(&self) -> bool {
        match self.client.get(&self.url).timeout(self.timeout).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                debug!(status = %response.status(), "Readiness probe returned not ready");
                false
            }
            Err(e) => {
                debug!(error = %e, "Readiness probe failed");
                false
            }
        }
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

/// Fixed-interval poller with a cumulative deadline.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessGate {
    interval: Duration,
}

impl ReadinessGate {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll `probe` until it reports ready or `timeout` has elapsed since the
    /// first probe. Never errors.
    pub async fn wait_until_ready(
        &self,
        probe: &dyn ReadinessProbe,
        timeout: Duration,
    ) -> ReadinessResult {
        let endpoint = probe.endpoint();
        info!(endpoint = %endpoint, timeout_secs = timeout.as_secs_f64(), "Waiting for readiness");

        let start = Instant::now();
        let mut attempts: u64 = 0;
        loop {
            attempts += 1;
            let ready = probe.is_ready().await;
            let result = if ready { "ready" } else { "not_ready" };
            metrics::counter!("llmlaunch_readiness_probes_total", "result" => result).increment(1);

            if ready {
                let elapsed = start.elapsed();
                info!(endpoint = %endpoint, attempts, elapsed_secs = elapsed.as_secs_f64(), "Server is ready");
                return ReadinessResult::Ready(elapsed);
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                warn!(endpoint = %endpoint, attempts, elapsed_secs = elapsed.as_secs_f64(), "Readiness timed out");
                return ReadinessResult::TimedOut(elapsed);
            }

            // Never sleep past the deadline
            tokio::time::sleep(self.interval.min(timeout - elapsed)).await;
        }
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
