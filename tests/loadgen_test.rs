//! Arrival-rate properties of the load generator, on the paused clock.

use async_trait::async_trait;
use llmlaunch::{ArrivalDistribution, LaunchError, LoadGenerator, RequestSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Records when each request was issued, then takes `latency` to answer.
struct RecordingSender {
    origin: Instant,
    latency: Duration,
    issued: Mutex<Vec<Duration>>,
}

#[async_trait]
impl RequestSender for RecordingSender {
    async fn send(&self, _index: usize, _prompt: &str) -> Result<(), LaunchError> {
        self.issued.lock().unwrap().push(self.origin.elapsed());
        tokio::time::sleep(self.latency).await;
        Ok(())
    }
}

fn sender(latency: Duration) -> Arc<RecordingSender> {
    Arc::new(RecordingSender {
        origin: Instant::now(),
        latency,
        issued: Mutex::new(Vec::new()),
    })
}

#[tokio::test(start_paused = true)]
async fn poisson_schedule_ignores_latency() {
    let n = 200;
    let rate = 20.0;
    let expected = Duration::from_secs_f64(n as f64 / rate);

    for latency in [Duration::from_millis(1), Duration::from_secs(120)] {
        let sender = sender(latency);
        let run = LoadGenerator::new(sender.clone(), vec!["p".to_string()])
            .with_seed(Some(11))
            .run(n, rate, ArrivalDistribution::Poisson, &CancellationToken::new())
            .await;

        assert_eq!(run.scheduled, n);
        assert_eq!(run.summary().succeeded, n);

        let issued = sender.issued.lock().unwrap();
        let last = *issued.iter().max().unwrap();
        assert!(
            last < expected * 2,
            "last arrival at {:?} with latency {:?}",
            last,
            latency
        );
        assert!(last > expected / 2);
    }
}

#[tokio::test(start_paused = true)]
async fn infinite_rate_dispatches_everything_at_once() {
    let sender = sender(Duration::from_secs(1));
    let run = LoadGenerator::new(sender.clone(), vec![])
        .run(
            50,
            f64::INFINITY,
            ArrivalDistribution::Poisson,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(run.records.len(), 50);
    assert!(sender.issued.lock().unwrap().iter().all(|t| t.is_zero()));
    assert!(run.elapsed < Duration::from_millis(1_100));
}
