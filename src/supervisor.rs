//! Lifecycle supervisor: drives one launch from start to teardown.
//!
//! ```text
//! Idle -> Starting -> Waiting -> (Benchmarking) -> Stopping -> Done
//!            |           |             |               ^
//!            +-----------+-------------+---------------+
//!                 failure, timeout or interrupt
//! ```
//!
//! Every path ends in the same teardown routine, which hands the cluster
//! handle to the controller exactly once. `interrupt()` may be called from
//! any task while `run()` is in progress.

use crate::config::LaunchConfig;
use crate::controller::{ClusterController, ClusterHandle};
use crate::loadgen::{ArrivalDistribution, BenchmarkRun, LoadGenerator};
use crate::readiness::{ReadinessGate, ReadinessProbe};
use crate::types::{LaunchError, ReadinessResult, SupervisorState};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Benchmark to run once the server is ready.
pub struct BenchmarkPlan {
    pub generator: LoadGenerator,
    pub request_count: usize,
    pub rate: f64,
    pub distribution: ArrivalDistribution,
}

/// What happened during a launch.
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    /// Every state entered, in order, starting with `Idle`
    pub transitions: Vec<SupervisorState>,
    pub readiness: Option<ReadinessResult>,
    pub benchmark: Option<BenchmarkRun>,
    /// The failure that ended the launch, if any
    pub error: Option<LaunchError>,
    pub interrupted: bool,
}

impl LaunchOutcome {
    fn new() -> Self {
        Self {
            transitions: vec![SupervisorState::Idle],
            readiness: None,
            benchmark: None,
            error: None,
            interrupted: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Process exit code: 0 for a clean or interrupted run, 1 for a failure.
    pub fn exit_code(&self) -> i32 {
        if self.error.is_some() { 1 } else { 0 }
    }

    pub fn visited(&self, state: SupervisorState) -> bool {
        self.transitions.contains(&state)
    }
}

pub struct LifecycleSupervisor {
    controller: Arc<dyn ClusterController>,
    probe: Arc<dyn ReadinessProbe>,
    gate: ReadinessGate,
    readiness_timeout: Duration,
    benchmark: Option<BenchmarkPlan>,
    cancel: CancellationToken,
    state: watch::Sender<SupervisorState>,
}

impl LifecycleSupervisor {
    pub fn new(
        controller: Arc<dyn ClusterController>,
        probe: Arc<dyn ReadinessProbe>,
        readiness_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            controller,
            probe,
            gate: ReadinessGate::default(),
            readiness_timeout,
            benchmark: None,
            cancel: CancellationToken::new(),
            state,
        }
    }

    pub fn with_gate(mut self, gate: ReadinessGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_benchmark(mut self, plan: Option<BenchmarkPlan>) -> Self {
        self.benchmark = plan;
        self
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Request shutdown. Ignored once teardown has begun.
    pub fn interrupt(&self) {
        let state = self.state();
        if state.is_interruptible() {
            info!(state = %state, "Interrupt received, shutting down");
            self.cancel.cancel();
        } else {
            debug!(state = %state, "Interrupt ignored");
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run the launch to completion. Only the first call does anything.
    pub async fn run(&self, launch: &LaunchConfig) -> LaunchOutcome {
        let mut outcome = LaunchOutcome::new();
        if self.state() != SupervisorState::Idle {
            warn!(state = %self.state(), "Supervisor already ran");
            outcome.error = Some(LaunchError::launch("supervisor", "already ran"));
            return outcome;
        }

        let mut handle = ClusterHandle::new();
        if self.is_interrupted() {
            outcome.interrupted = true;
        } else {
            self.launch(launch, &mut handle, &mut outcome).await;
        }

        self.teardown(&mut handle, &mut outcome).await;
        self.report(&outcome);
        outcome
    }

    async fn launch(
        &self,
        launch: &LaunchConfig,
        handle: &mut ClusterHandle,
        outcome: &mut LaunchOutcome,
    ) {
        // Starting: bounded, so an interrupt here is honored once it returns
        self.transition(SupervisorState::Starting, outcome);
        let phase = Instant::now();
        let started = self.controller.start(launch).await;
        record_phase(SupervisorState::Starting, phase);
        match started {
            Ok(started) => *handle = started,
            Err(e) => {
                error!(error = %e, "Launch failed");
                outcome.error = Some(e);
                return;
            }
        }
        if self.is_interrupted() {
            outcome.interrupted = true;
            return;
        }

        self.transition(SupervisorState::Waiting, outcome);
        let phase = Instant::now();
        let readiness = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.gate.wait_until_ready(self.probe.as_ref(), self.readiness_timeout) => Some(result),
        };
        record_phase(SupervisorState::Waiting, phase);

        let Some(readiness) = readiness else {
            outcome.interrupted = true;
            return;
        };
        outcome.readiness = Some(readiness);
        if let ReadinessResult::TimedOut(elapsed) = readiness {
            let err = LaunchError::ReadinessTimeout {
                endpoint: self.probe.endpoint(),
                elapsed,
            };
            error!(error = %err, "Server never became ready");
            outcome.error = Some(err);
            return;
        }

        let Some(ref plan) = self.benchmark else {
            return;
        };

        self.transition(SupervisorState::Benchmarking, outcome);
        let phase = Instant::now();
        let run = plan
            .generator
            .run(plan.request_count, plan.rate, plan.distribution, &self.cancel)
            .await;
        record_phase(SupervisorState::Benchmarking, phase);

        let summary = run.summary();
        info!(
            completed = summary.completed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            success_rate = summary.success_rate,
            p50_ms = summary.p50_latency.as_secs_f64() * 1000.0,
            p99_ms = summary.p99_latency.as_secs_f64() * 1000.0,
            throughput = summary.throughput,
            aborted = summary.aborted,
            "Benchmark finished"
        );

        if run.aborted && self.is_interrupted() {
            outcome.interrupted = true;
        }
        if let Some(ref err) = run.fail_fast_error {
            outcome.error = Some(err.clone());
        }
        outcome.benchmark = Some(run);
    }

    /// The single exit funnel.
    async fn teardown(&self, handle: &mut ClusterHandle, outcome: &mut LaunchOutcome) {
        self.transition(SupervisorState::Stopping, outcome);
        let phase = Instant::now();
        self.controller.stop(handle).await;
        record_phase(SupervisorState::Stopping, phase);
        self.transition(SupervisorState::Done, outcome);
    }

    fn transition(&self, next: SupervisorState, outcome: &mut LaunchOutcome) {
        let previous = self.state.send_replace(next);
        info!(from = %previous, to = %next, "Phase transition");
        outcome.transitions.push(next);
    }

    fn report(&self, outcome: &LaunchOutcome) {
        match outcome.error {
            Some(ref e) => error!(error = %e, "Launch finished with failure"),
            None if outcome.interrupted => info!("Launch interrupted, cluster stopped"),
            None => info!("Launch finished successfully"),
        }
    }
}

fn record_phase(phase: SupervisorState, started: Instant) {
    metrics::histogram!("llmlaunch_phase_duration_seconds", "phase" => phase.as_str())
        .record(started.elapsed().as_secs_f64());
}
