use crate::config::{LaunchConfig, ServerConfig};
use crate::types::LaunchError;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Strip ANSI escape sequences from a string.
pub(crate) fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // Skip until we hit a letter (end of escape sequence)
            for c2 in chars.by_ref() {
                if c2.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// SIGKILL the whole process group led by `pid`. A group that is already
/// gone is not an error.
pub(crate) fn kill_process_group(pid: u32) -> std::io::Result<()> {
    // SAFETY: signalling a process group we spawned.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Full argument list for the API server: entrypoint, generated options,
/// then the configured extras.
pub(crate) fn command_args(server: &ServerConfig, launch: &LaunchConfig) -> Vec<String> {
    let mut args = server.entrypoint_args.clone();
    args.extend(launch.server_args());
    args.extend(server.extra_args.iter().cloned());
    args
}

/// Spawn the API server in its own process group so the whole tree (engine
/// workers included) can be killed at once.
pub(crate) fn spawn(server: &ServerConfig, launch: &LaunchConfig) -> Result<Child, LaunchError> {
    let args = command_args(server, launch);
    info!(
        command = %server.command,
        host = %launch.host,
        port = launch.port,
        instances = launch.initial_instances,
        speculative = launch.is_speculative(),
        "Starting API server"
    );
    debug!(args = ?args, "API server command args");

    let mut child = Command::new(&server.command)
        .args(&args)
        .envs(&server.env)
        .env("NO_COLOR", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|e| LaunchError::launch("api-server", e.to_string()))?;

    // Forward output under the "server" target, filterable via
    // RUST_LOG (e.g. RUST_LOG=info,server=debug).
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, "stderr"));
    }

    Ok(child)
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let clean = strip_ansi(&line);
        if !clean.is_empty() {
            debug!(target: "server", stream = stream, "{}", clean);
        }
    }
}

/// Kill the server's process group and reap the leader.
pub(crate) async fn terminate(pid: Option<u32>, mut child: Child) -> Result<(), String> {
    match pid {
        Some(pid) => kill_process_group(pid)
            .map_err(|e| format!("failed to signal process group {}: {}", pid, e))?,
        None => {
            // Already reaped
            if let Ok(Some(_)) = child.try_wait() {
                return Ok(());
            }
            child.kill().await.map_err(|e| e.to_string())?;
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| format!("failed to reap API server: {}", e))?;
    debug!(status = %status, "API server exited");
    Ok(())
}
