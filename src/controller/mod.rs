//! Cluster controller: owns the backing cluster and the API server process.
//!
//! [`ProcessController`] clears stale cluster processes, starts (or joins)
//! the cluster, then spawns the API server in its own process group.
//! Stopping kills that process group and force-stops the cluster.
//!
//! `stop` never fails and is a no-op on a handle that is not running, so the
//! supervisor can funnel every exit path through it.

mod cluster;
mod server;

pub use cluster::{ClusterRole, RayCluster};

use crate::config::{ClusterConfig, LaunchConfig, ServerConfig};
use crate::types::LaunchError;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Lifecycle of a [`ClusterHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    NotStarted,
    Running,
    Stopped,
}

/// A started cluster plus API server.
///
/// Once a handle reaches `Running` it must be passed to
/// [`ClusterController::stop`] before the process exits.
#[derive(Debug)]
pub struct ClusterHandle {
    state: HandleState,
    pid: Option<u32>,
    started_at: Option<Instant>,
    server: Option<Child>,
    cluster_started: bool,
}

impl ClusterHandle {
    /// A handle with nothing behind it
    pub fn new() -> Self {
        Self {
            state: HandleState::NotStarted,
            pid: None,
            started_at: None,
            server: None,
            cluster_started: false,
        }
    }

    /// A running handle with no owned process, for controllers that manage
    /// their processes elsewhere.
    pub fn running(pid: Option<u32>) -> Self {
        Self {
            state: HandleState::Running,
            pid,
            started_at: Some(Instant::now()),
            server: None,
            cluster_started: false,
        }
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == HandleState::Running
    }

    /// API server process id (also its process group id)
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    /// Transition `Running -> Stopped`. Returns `false` (and changes nothing)
    /// if the handle was not running.
    pub fn mark_stopped(&mut self) -> bool {
        if self.state != HandleState::Running {
            return false;
        }
        self.state = HandleState::Stopped;
        true
    }
}

impl Default for ClusterHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Starts and stops the serving stack.
#[async_trait]
pub trait ClusterController: Send + Sync {
    /// Start the cluster and API server. Bounded: returns once processes are
    /// spawned, without waiting for readiness.
    async fn start(&self, launch: &LaunchConfig) -> Result<ClusterHandle, LaunchError>;

    /// Tear everything down. Idempotent and infallible; failures are logged.
    async fn stop(&self, handle: &mut ClusterHandle);
}

/// Controller backed by real OS processes.
pub struct ProcessController {
    server: ServerConfig,
    cluster: Option<RayCluster>,
}

impl ProcessController {
    pub fn new(server: ServerConfig, cluster: &ClusterConfig) -> Self {
        Self {
            server,
            cluster: cluster.enabled.then(|| RayCluster::from_config(cluster)),
        }
    }

    async fn stop_cluster(&self, cluster: &RayCluster) {
        if let Err(reason) = cluster.stop_force().await {
            report_teardown_failure(LaunchError::teardown("cluster", reason));
        }
    }
}

#[async_trait]
impl ClusterController for ProcessController {
    async fn start(&self, launch: &LaunchConfig) -> Result<ClusterHandle, LaunchError> {
        let started_at = Instant::now();
        let mut cluster_started = false;

        if let Some(ref cluster) = self.cluster {
            info!(role = ?cluster.role(), "Clearing stale cluster processes");
            cluster
                .stop_force()
                .await
                .map_err(|reason| LaunchError::launch("cluster", reason))?;
            if let Err(e) = cluster.start(launch.node_address).await {
                warn!(error = %e, "Cluster failed to start, clearing partial state");
                self.stop_cluster(cluster).await;
                return Err(e);
            }
            cluster_started = true;
        }

        let child = match server::spawn(&self.server, launch) {
            Ok(child) => child,
            Err(e) => {
                if let Some(ref cluster) = self.cluster
                    && cluster_started
                {
                    warn!(error = %e, "API server failed to start, stopping cluster");
                    self.stop_cluster(cluster).await;
                }
                return Err(e);
            }
        };

        let pid = child.id();
        info!(pid = ?pid, "API server spawned");

        Ok(ClusterHandle {
            state: HandleState::Running,
            pid,
            started_at: Some(started_at),
            server: Some(child),
            cluster_started,
        })
    }

    async fn stop(&self, handle: &mut ClusterHandle) {
        if !handle.mark_stopped() {
            debug!(state = ?handle.state(), "Nothing to stop");
            return;
        }

        if let Some(child) = handle.server.take() {
            info!(pid = ?handle.pid, "Stopping API server");
            if let Err(reason) = server::terminate(handle.pid, child).await {
                report_teardown_failure(LaunchError::teardown("api-server", reason));
            }
        }

        if handle.cluster_started
            && let Some(ref cluster) = self.cluster
        {
            info!("Stopping cluster");
            self.stop_cluster(cluster).await;
        }

        info!(
            uptime_secs = handle.uptime().map(|d| d.as_secs_f64()).unwrap_or_default(),
            "Cluster stopped"
        );
    }
}

fn report_teardown_failure(err: LaunchError) {
    metrics::counter!("llmlaunch_teardown_failures_total").increment(1);
    warn!(error = %err, "Teardown step failed");
}
