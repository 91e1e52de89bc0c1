//! Backing cluster (Ray) commands.

use crate::config::ClusterConfig;
use crate::types::LaunchError;
use std::net::IpAddr;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Whether this node starts the cluster or joins one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterRole {
    Head,
    Worker { head_address: String },
}

/// Drives the cluster manager CLI.
#[derive(Debug, Clone)]
pub struct RayCluster {
    command: String,
    port: u16,
    role: ClusterRole,
    start_attempts: u32,
    retry_interval: Duration,
}

impl RayCluster {
    pub fn from_config(config: &ClusterConfig) -> Self {
        let role = match (&config.head_address, config.worker) {
            (Some(head), true) => ClusterRole::Worker {
                head_address: head.clone(),
            },
            _ => ClusterRole::Head,
        };
        Self {
            command: config.command.clone(),
            port: config.port,
            role,
            start_attempts: config.start_attempts.max(1),
            retry_interval: config.retry_interval(),
        }
    }

    pub fn role(&self) -> &ClusterRole {
        &self.role
    }

    pub(crate) fn start_args(&self, node: IpAddr) -> Vec<String> {
        let mut args = vec!["start".to_string()];
        match self.role {
            ClusterRole::Head => {
                args.push("--head".to_string());
                args.push(format!("--port={}", self.port));
            }
            ClusterRole::Worker { ref head_address } => {
                args.push(format!("--address={}", join_host_port(head_address, self.port)));
            }
        }
        args.push(format!("--node-ip-address={}", node));
        args
    }

    /// Force-stop any cluster processes on this node.
    pub async fn stop_force(&self) -> Result<(), String> {
        self.run(&["stop".to_string(), "--force".to_string()]).await
    }

    /// Start (head) or join (worker) the cluster. Workers retry until the
    /// head node accepts them or the attempts run out.
    pub async fn start(&self, node: IpAddr) -> Result<(), LaunchError> {
        let args = self.start_args(node);
        let attempts = match self.role {
            ClusterRole::Head => 1,
            ClusterRole::Worker { .. } => self.start_attempts,
        };

        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.run(&args).await {
                Ok(()) => {
                    info!(role = ?self.role, node = %node, attempt, "Cluster started");
                    return Ok(());
                }
                Err(e) => {
                    if attempt < attempts {
                        warn!(attempt, attempts, error = %e, "Cluster start failed, retrying");
                        tokio::time::sleep(self.retry_interval).await;
                    }
                    last_error = e;
                }
            }
        }

        Err(LaunchError::launch(
            "cluster",
            format!("start failed after {} attempt(s): {}", attempts, last_error),
        ))
    }

    async fn run(&self, args: &[String]) -> Result<(), String> {
        debug!(command = %self.command, args = ?args, "Running cluster command");
        let output = Command::new(&self.command)
            .args(args)
            .env("NO_COLOR", "1")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("{}: {}", self.command, e))?;

        for line in String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
        {
            let clean = super::server::strip_ansi(line);
            if !clean.trim().is_empty() {
                debug!(target: "cluster", "{}", clean);
            }
        }

        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "`{} {}` exited with {}",
                self.command,
                args.join(" "),
                output.status
            ))
        }
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
