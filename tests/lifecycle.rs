//! Supervisor lifecycle tests with scripted controllers, probes and senders.
//!
//! No processes or sockets: everything runs on the paused tokio clock.

use async_trait::async_trait;
use llmlaunch::{
    ArrivalDistribution, BenchmarkPlan, ClusterController, ClusterHandle, Config, Environment,
    LaunchConfig, LaunchError, LifecycleSupervisor, LoadGenerator, ReadinessGate,
    ReadinessProbe, RequestSender, SupervisorState,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Records every start/stop call.
#[derive(Default)]
struct ScriptedController {
    starts: AtomicUsize,
    stops: AtomicUsize,
    start_delay: Duration,
    launched: Mutex<Vec<LaunchConfig>>,
}

#[async_trait]
impl ClusterController for ScriptedController {
    async fn start(&self, launch: &LaunchConfig) -> Result<ClusterHandle, LaunchError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.launched.lock().unwrap().push(launch.clone());
        tokio::time::sleep(self.start_delay).await;
        Ok(ClusterHandle::running(Some(4242)))
    }

    async fn stop(&self, handle: &mut ClusterHandle) {
        if handle.mark_stopped() {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Becomes ready `ready_after` after construction, or never.
struct DelayedProbe {
    created: Instant,
    ready_after: Option<Duration>,
}

impl DelayedProbe {
    fn new(ready_after: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            created: Instant::now(),
            ready_after,
        })
    }
}

#[async_trait]
impl ReadinessProbe for DelayedProbe {
    async fn is_ready(&self) -> bool {
        self.ready_after
            .is_some_and(|after| self.created.elapsed() >= after)
    }

    fn endpoint(&self) -> String {
        "http://10.0.0.7:8000/is_ready".to_string()
    }
}

struct SlowSender {
    latency: Duration,
    sent: AtomicUsize,
}

#[async_trait]
impl RequestSender for SlowSender {
    async fn send(&self, _index: usize, _prompt: &str) -> Result<(), LaunchError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        Ok(())
    }
}

fn launch_config(accelerators: u32) -> LaunchConfig {
    let mut config = Config::default();
    config.server.model_path = "/mnt/model/Qwen-7B".to_string();
    config.launch_config(&Environment {
        local_address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
        accelerator_count: accelerators,
    })
}

fn benchmark(sender: Arc<SlowSender>, requests: usize) -> BenchmarkPlan {
    BenchmarkPlan {
        generator: LoadGenerator::new(sender, vec!["hi".to_string()]).with_seed(Some(1)),
        request_count: requests,
        rate: 5.0,
        distribution: ArrivalDistribution::Poisson,
    }
}

#[tokio::test(start_paused = true)]
async fn ready_immediately_without_benchmark() {
    let controller = Arc::new(ScriptedController::default());
    let supervisor = LifecycleSupervisor::new(
        controller.clone(),
        DelayedProbe::new(Some(Duration::ZERO)),
        Duration::from_secs(180),
    );

    let outcome = supervisor.run(&launch_config(4)).await;

    assert!(outcome.is_success());
    assert!(outcome.readiness.unwrap().is_ready());
    assert!(!outcome.visited(SupervisorState::Benchmarking));
    assert_eq!(controller.starts.load(Ordering::SeqCst), 1);
    assert_eq!(controller.stops.load(Ordering::SeqCst), 1);
    assert_eq!(supervisor.state(), SupervisorState::Done);

    let launched = controller.launched.lock().unwrap();
    let args = launched[0].server_args();
    let pos = args.iter().position(|a| a == "--initial-instances").unwrap();
    assert_eq!(args[pos + 1], "4");
    assert!(!args.iter().any(|a| a.contains("speculative")));
}

#[tokio::test(start_paused = true)]
async fn never_ready_times_out_and_stops() {
    let controller = Arc::new(ScriptedController::default());
    let supervisor = LifecycleSupervisor::new(
        controller.clone(),
        DelayedProbe::new(None),
        Duration::from_secs(180),
    )
    .with_gate(ReadinessGate::new(Duration::from_secs(1)));

    let outcome = supervisor.run(&launch_config(1)).await;

    match outcome.error {
        Some(LaunchError::ReadinessTimeout { ref endpoint, elapsed }) => {
            assert_eq!(endpoint, "http://10.0.0.7:8000/is_ready");
            assert!(elapsed >= Duration::from_secs(180));
            assert!(elapsed < Duration::from_secs(181));
        }
        ref other => panic!("expected readiness timeout, got {:?}", other),
    }
    assert_eq!(
        &outcome.transitions[outcome.transitions.len() - 2..],
        &[SupervisorState::Stopping, SupervisorState::Done]
    );
    assert_eq!(controller.stops.load(Ordering::SeqCst), 1);
    assert_ne!(outcome.exit_code(), 0);
}

#[tokio::test(start_paused = true)]
async fn benchmark_runs_after_readiness() {
    let controller = Arc::new(ScriptedController::default());
    let sender = Arc::new(SlowSender {
        latency: Duration::from_millis(200),
        sent: AtomicUsize::new(0),
    });
    let supervisor = LifecycleSupervisor::new(
        controller.clone(),
        DelayedProbe::new(Some(Duration::from_secs(3))),
        Duration::from_secs(180),
    )
    .with_benchmark(Some(benchmark(sender.clone(), 20)));

    let outcome = supervisor.run(&launch_config(2)).await;

    assert!(outcome.is_success());
    assert_eq!(
        outcome.transitions,
        vec![
            SupervisorState::Idle,
            SupervisorState::Starting,
            SupervisorState::Waiting,
            SupervisorState::Benchmarking,
            SupervisorState::Stopping,
            SupervisorState::Done,
        ]
    );
    let summary = outcome.benchmark.unwrap().summary();
    assert_eq!(summary.succeeded, 20);
    assert!(!summary.aborted);
    assert_eq!(sender.sent.load(Ordering::SeqCst), 20);
    assert_eq!(controller.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn interrupt_during_benchmark_stops_once() {
    let controller = Arc::new(ScriptedController::default());
    let sender = Arc::new(SlowSender {
        latency: Duration::from_secs(10),
        sent: AtomicUsize::new(0),
    });
    let supervisor = Arc::new(
        LifecycleSupervisor::new(
            controller.clone(),
            DelayedProbe::new(Some(Duration::ZERO)),
            Duration::from_secs(180),
        )
        .with_benchmark(Some(benchmark(sender.clone(), 1_000))),
    );

    let mut states = supervisor.subscribe();
    let interrupter = supervisor.clone();
    tokio::spawn(async move {
        states
            .wait_for(|s| *s == SupervisorState::Benchmarking)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        interrupter.interrupt();
        interrupter.interrupt();
    });

    let outcome = supervisor.run(&launch_config(1)).await;

    assert!(outcome.interrupted);
    assert_eq!(outcome.exit_code(), 0);
    let run = outcome.benchmark.unwrap();
    assert!(run.aborted);
    assert!(run.scheduled < 1_000);
    assert!(run.fail_fast_error.is_none());
    assert_eq!(controller.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn interrupt_during_start_is_honored_after_start() {
    let controller = Arc::new(ScriptedController {
        start_delay: Duration::from_secs(5),
        ..Default::default()
    });
    let supervisor = Arc::new(LifecycleSupervisor::new(
        controller.clone(),
        DelayedProbe::new(Some(Duration::ZERO)),
        Duration::from_secs(180),
    ));

    let mut states = supervisor.subscribe();
    let interrupter = supervisor.clone();
    tokio::spawn(async move {
        states
            .wait_for(|s| *s == SupervisorState::Starting)
            .await
            .unwrap();
        interrupter.interrupt();
    });

    let outcome = supervisor.run(&launch_config(1)).await;

    assert!(outcome.interrupted);
    assert!(!outcome.visited(SupervisorState::Waiting));
    assert_eq!(controller.starts.load(Ordering::SeqCst), 1);
    assert_eq!(controller.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn fail_fast_benchmark_fails_launch() {
    struct FailingSender;

    #[async_trait]
    impl RequestSender for FailingSender {
        async fn send(&self, index: usize, _prompt: &str) -> Result<(), LaunchError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err(LaunchError::RequestFailure {
                index,
                reason: "HTTP 503 Service Unavailable".to_string(),
            })
        }
    }

    let controller = Arc::new(ScriptedController::default());
    let supervisor = LifecycleSupervisor::new(
        controller.clone(),
        DelayedProbe::new(Some(Duration::ZERO)),
        Duration::from_secs(180),
    )
    .with_benchmark(Some(BenchmarkPlan {
        generator: LoadGenerator::new(Arc::new(FailingSender), vec![]).with_fail_fast(true),
        request_count: 50,
        rate: 10.0,
        distribution: ArrivalDistribution::Uniform,
    }));

    let outcome = supervisor.run(&launch_config(1)).await;

    assert!(!outcome.interrupted);
    assert!(matches!(
        outcome.error,
        Some(LaunchError::RequestFailure { index: 0, .. })
    ));
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(controller.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn tiny_rate_still_tears_down() {
    let controller = Arc::new(ScriptedController::default());
    let sender = Arc::new(SlowSender {
        latency: Duration::from_millis(10),
        sent: AtomicUsize::new(0),
    });
    let supervisor = LifecycleSupervisor::new(
        controller.clone(),
        DelayedProbe::new(Some(Duration::ZERO)),
        Duration::from_secs(180),
    )
    .with_benchmark(Some(BenchmarkPlan {
        generator: LoadGenerator::new(sender.clone(), vec![]),
        request_count: 2,
        rate: 1e-20,
        distribution: ArrivalDistribution::Uniform,
    }));

    let outcome = supervisor.run(&launch_config(1)).await;

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(sender.sent.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.benchmark.unwrap().summary().succeeded, 2);
    assert_eq!(controller.stops.load(Ordering::SeqCst), 1);
}
