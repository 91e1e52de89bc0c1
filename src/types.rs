//! Shared domain types used across the codebase.

use std::time::Duration;

/// Errors surfaced to the lifecycle supervisor.
///
/// Only the supervisor decides whether one of these aborts the launch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    /// A process could not be spawned or the cluster refused to start.
    #[error("failed to launch {component}: {reason}")]
    LaunchFailure {
        component: &'static str,
        reason: String,
    },

    #[error("server at {endpoint} not ready after {elapsed:?}")]
    ReadinessTimeout { endpoint: String, elapsed: Duration },

    /// A single benchmark request failed. Fatal only in fail-fast mode.
    #[error("benchmark request {index} failed: {reason}")]
    RequestFailure { index: usize, reason: String },

    /// Logged, never escalated.
    #[error("failed to tear down {component}: {reason}")]
    TeardownFailure {
        component: &'static str,
        reason: String,
    },
}

impl LaunchError {
    pub(crate) fn launch(component: &'static str, reason: impl Into<String>) -> Self {
        Self::LaunchFailure {
            component,
            reason: reason.into(),
        }
    }

    pub(crate) fn teardown(component: &'static str, reason: impl Into<String>) -> Self {
        Self::TeardownFailure {
            component,
            reason: reason.into(),
        }
    }
}

/// Terminal outcome of the readiness polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessResult {
    Ready(Duration),
    TimedOut(Duration),
}

impl ReadinessResult {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessResult::Ready(_))
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            ReadinessResult::Ready(elapsed) | ReadinessResult::TimedOut(elapsed) => *elapsed,
        }
    }
}

/// State of the lifecycle supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Nothing started yet
    Idle,
    /// Cluster and API server are being launched
    Starting,
    /// Polling the readiness endpoint
    Waiting,
    /// Running the load generator against the ready server
    Benchmarking,
    /// Tearing down the cluster
    Stopping,
    /// Terminal
    Done,
}

impl SupervisorState {
    /// Whether an interrupt in this state forces a transition to `Stopping`.
    pub fn is_interruptible(&self) -> bool {
        matches!(
            self,
            SupervisorState::Idle
                | SupervisorState::Starting
                | SupervisorState::Waiting
                | SupervisorState::Benchmarking
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Starting => "starting",
            SupervisorState::Waiting => "waiting",
            SupervisorState::Benchmarking => "benchmarking",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Done => "done",
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
