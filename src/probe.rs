//! Environment discovery: local network address and accelerator count.
//!
//! Discovery never fails. A node without a usable interface advertises
//! loopback, and a node where the device query is missing or broken is
//! treated as having a single accelerator.

use crate::config::ProbeConfig;
use std::net::{IpAddr, Ipv4Addr};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// What the launch is sized against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Environment {
    pub local_address: IpAddr,
    /// Always at least 1
    pub accelerator_count: u32,
}

pub struct EnvironmentProber {
    device_query: Vec<String>,
}

impl EnvironmentProber {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            device_query: config.device_query.clone(),
        }
    }

    pub async fn discover(&self) -> Environment {
        let local_address = local_address();
        let accelerator_count = self.accelerator_count().await;
        info!(
            address = %local_address,
            accelerators = accelerator_count,
            "Discovered environment"
        );
        Environment {
            local_address,
            accelerator_count,
        }
    }

    /// Count accelerators by running the device query, one line per device.
    pub async fn accelerator_count(&self) -> u32 {
        let Some((program, args)) = self.device_query.split_first() else {
            return 1;
        };

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => {
                let count = count_devices(&String::from_utf8_lossy(&out.stdout));
                if count == 0 {
                    warn!(command = %program, "Device query listed no accelerators, assuming 1");
                    1
                } else {
                    count
                }
            }
            Ok(out) => {
                warn!(
                    "{} failed with status {}: {}",
                    program,
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                1
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("{} not found, assuming 1 accelerator", program);
                1
            }
            Err(e) => {
                warn!("Failed to run {}: {}", program, e);
                1
            }
        }
    }
}

fn count_devices(stdout: &str) -> u32 {
    stdout.lines().filter(|line| !line.trim().is_empty()).count() as u32
}

/// First non-loopback interface address, IPv4 preferred, else 127.0.0.1.
pub fn local_address() -> IpAddr {
    match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => select_address(&interfaces),
        Err(e) => {
            warn!(error = %e, "Failed to list network interfaces, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn select_address(interfaces: &[(String, IpAddr)]) -> IpAddr {
    let usable = || {
        interfaces
            .iter()
            .filter(|(_, ip)| !ip.is_loopback() && !ip.is_unspecified())
    };

    let chosen = usable()
        .find(|(_, ip)| ip.is_ipv4())
        .or_else(|| usable().next());

    match chosen {
        Some((name, ip)) => {
            debug!(interface = %name, address = %ip, "Selected local address");
            *ip
        }
        None => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}
