//! Open-loop load generator.
//!
//! Requests are released on an arrival schedule (Poisson or uniform) and
//! each one runs as its own task, so a slow server never slows the arrival
//! rate down. Every completion is recorded with its latency and outcome.
//!
//! The run stops early when the caller's cancellation token fires, or on the
//! first failure in fail-fast mode. Either way, outstanding requests are
//! aborted and the partial run is returned with `aborted` set.

pub mod dataset;

use crate::types::LaunchError;
use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How inter-arrival gaps are drawn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrivalDistribution {
    /// Exponential gaps with mean `1/rate`
    #[default]
    Poisson,
    /// Fixed `1/rate` spacing
    Uniform,
}

impl FromStr for ArrivalDistribution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "poisson" => Ok(Self::Poisson),
            "uniform" => Ok(Self::Uniform),
            other => Err(format!(
                "unknown distribution '{}', expected 'poisson' or 'uniform'",
                other
            )),
        }
    }
}

impl fmt::Display for ArrivalDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Poisson => f.write_str("poisson"),
            Self::Uniform => f.write_str("uniform"),
        }
    }
}

/// Longest gap between two arrivals. Samples beyond it (or beyond what a
/// `Duration` can hold) are clamped.
pub const MAX_ARRIVAL_GAP: Duration = Duration::from_secs(365 * 24 * 3600);

/// Inter-arrival gap sampler.
struct ArrivalProcess {
    distribution: ArrivalDistribution,
    rate: f64,
    exp: Option<Exp<f64>>,
    rng: StdRng,
}

impl ArrivalProcess {
    fn new(rate: f64, distribution: ArrivalDistribution, seed: Option<u64>) -> Self {
        let exp = if rate.is_finite() && rate > 0.0 {
            Exp::new(rate).ok()
        } else {
            None
        };
        Self {
            distribution,
            rate,
            exp,
            rng: match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
        }
    }

    fn next_gap(&mut self) -> Duration {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Duration::ZERO;
        }
        let secs = match (self.distribution, &self.exp) {
            (ArrivalDistribution::Poisson, Some(exp)) => exp.sample(&mut self.rng),
            _ => 1.0 / self.rate,
        };
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_ARRIVAL_GAP)
            .min(MAX_ARRIVAL_GAP)
    }
}

/// Issues one benchmark request.
#[async_trait]
pub trait RequestSender: Send + Sync {
    async fn send(&self, index: usize, prompt: &str) -> Result<(), LaunchError>;
}

/// POSTs a non-streaming completion request and waits for the full body.
pub struct HttpSender {
    client: reqwest::Client,
    url: String,
    max_tokens: u32,
    timeout: Duration,
}

impl HttpSender {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        endpoint: &str,
        max_tokens: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), endpoint),
            max_tokens,
            timeout,
        }
    }
}

#[async_trait]
impl RequestSender for HttpSender {
    async fn send(&self, index: usize, prompt: &str) -> Result<(), LaunchError> {
        let failure = |reason: String| LaunchError::RequestFailure { index, reason };

        let body = serde_json::json!({
            "prompt": prompt,
            "max_tokens": self.max_tokens,
            "stream": false,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| failure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failure(format!("HTTP {}", status)));
        }
        response.bytes().await.map_err(|e| failure(e.to_string()))?;
        Ok(())
    }
}

/// Outcome of a single request
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub index: usize,
    pub latency: Duration,
    pub success: bool,
    pub error: Option<String>,
}

/// Everything recorded during one benchmark run.
#[derive(Debug, Clone)]
pub struct BenchmarkRun {
    pub request_count: usize,
    pub rate: f64,
    pub distribution: ArrivalDistribution,
    /// Completed requests, ordered by index
    pub records: Vec<RequestRecord>,
    /// Requests released before the run ended
    pub scheduled: usize,
    pub elapsed: Duration,
    pub aborted: bool,
    /// First failure, when it was the reason the run aborted
    pub fail_fast_error: Option<LaunchError>,
}

impl BenchmarkRun {
    pub fn summary(&self) -> BenchmarkSummary {
        let completed = self.records.len();
        let succeeded = self.records.iter().filter(|r| r.success).count();
        let failed = completed - succeeded;

        let mut latencies: Vec<Duration> = self
            .records
            .iter()
            .filter(|r| r.success)
            .map(|r| r.latency)
            .collect();
        latencies.sort();

        let mean_latency = if latencies.is_empty() {
            Duration::ZERO
        } else {
            latencies.iter().sum::<Duration>() / latencies.len() as u32
        };

        let secs = self.elapsed.as_secs_f64();
        BenchmarkSummary {
            request_count: self.request_count,
            scheduled: self.scheduled,
            completed,
            succeeded,
            failed,
            success_rate: if completed > 0 {
                succeeded as f64 / completed as f64
            } else {
                0.0
            },
            mean_latency,
            p50_latency: percentile(&latencies, 50.0),
            p90_latency: percentile(&latencies, 90.0),
            p99_latency: percentile(&latencies, 99.0),
            throughput: if secs > 0.0 { succeeded as f64 / secs } else { 0.0 },
            elapsed: self.elapsed,
            aborted: self.aborted,
        }
    }
}

/// Nearest-rank percentile of sorted values
fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Aggregate statistics of a [`BenchmarkRun`]. Latency figures cover
/// successful requests only.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkSummary {
    pub request_count: usize,
    pub scheduled: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub mean_latency: Duration,
    pub p50_latency: Duration,
    pub p90_latency: Duration,
    pub p99_latency: Duration,
    /// Successful requests per second of wall time
    pub throughput: f64,
    pub elapsed: Duration,
    pub aborted: bool,
}

impl fmt::Display for BenchmarkSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        writeln!(
            f,
            "Requests:    {}/{} completed ({} scheduled){}",
            self.completed,
            self.request_count,
            self.scheduled,
            if self.aborted { ", aborted" } else { "" }
        )?;
        writeln!(
            f,
            "Success:     {} ok, {} failed ({:.1}%)",
            self.succeeded,
            self.failed,
            self.success_rate * 100.0
        )?;
        writeln!(
            f,
            "Latency:     mean {:.1} ms, p50 {:.1} ms, p90 {:.1} ms, p99 {:.1} ms",
            ms(self.mean_latency),
            ms(self.p50_latency),
            ms(self.p90_latency),
            ms(self.p99_latency)
        )?;
        write!(
            f,
            "Throughput:  {:.2} req/s over {:.1} s",
            self.throughput,
            self.elapsed.as_secs_f64()
        )
    }
}

enum Event {
    Cancelled,
    Completed(Result<RequestRecord, JoinError>),
    Due,
}

pub struct LoadGenerator {
    sender: Arc<dyn RequestSender>,
    prompts: Arc<Vec<String>>,
    fail_fast: bool,
    seed: Option<u64>,
}

impl LoadGenerator {
    /// `prompts` are cycled over the requests; an empty list sends empty
    /// prompts.
    pub fn new(sender: Arc<dyn RequestSender>, prompts: Vec<String>) -> Self {
        Self {
            sender,
            prompts: Arc::new(prompts),
            fail_fast: false,
            seed: None,
        }
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Seed the arrival process for a reproducible schedule
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub async fn run(
        &self,
        request_count: usize,
        rate: f64,
        distribution: ArrivalDistribution,
        cancel: &CancellationToken,
    ) -> BenchmarkRun {
        info!(
            requests = request_count,
            qps = rate,
            distribution = %distribution,
            fail_fast = self.fail_fast,
            "Starting benchmark"
        );

        // Fail-fast cancels only this run; the caller's token cancels it too.
        let run_token = cancel.child_token();
        let mut arrivals = ArrivalProcess::new(rate, distribution, self.seed);
        let mut tasks: JoinSet<RequestRecord> = JoinSet::new();
        let mut records = Vec::with_capacity(request_count);
        let mut fail_fast_error = None;

        let start = Instant::now();
        let mut next_at = start;
        let mut scheduled = 0;

        while scheduled < request_count && !run_token.is_cancelled() {
            let event = tokio::select! {
                biased;
                _ = run_token.cancelled() => Event::Cancelled,
                Some(joined) = tasks.join_next() => Event::Completed(joined),
                _ = tokio::time::sleep_until(next_at) => Event::Due,
            };

            match event {
                Event::Cancelled => break,
                Event::Completed(joined) => {
                    self.record(joined, &mut records, &mut fail_fast_error, &run_token)
                }
                Event::Due => {
                    self.dispatch(&mut tasks, scheduled);
                    scheduled += 1;
                    let gap = arrivals.next_gap();
                    match next_at.checked_add(gap) {
                        Some(at) => next_at = at,
                        None => {
                            warn!(scheduled, gap_secs = gap.as_secs_f64(), "Arrival schedule overflowed, stopping early");
                            break;
                        }
                    }
                }
            }
        }
        debug!(scheduled, elapsed_secs = start.elapsed().as_secs_f64(), "Scheduling finished");

        while !tasks.is_empty() {
            let event = tokio::select! {
                biased;
                _ = run_token.cancelled() => Event::Cancelled,
                Some(joined) = tasks.join_next() => Event::Completed(joined),
            };
            match event {
                Event::Completed(joined) => {
                    self.record(joined, &mut records, &mut fail_fast_error, &run_token)
                }
                _ => break,
            }
        }

        let aborted = run_token.is_cancelled();
        if aborted {
            let outstanding = tasks.len();
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                if let Ok(record) = joined {
                    records.push(record);
                }
            }
            warn!(scheduled, outstanding, "Benchmark aborted");
        }

        records.sort_by_key(|r| r.index);
        BenchmarkRun {
            request_count,
            rate,
            distribution,
            records,
            scheduled,
            elapsed: start.elapsed(),
            aborted,
            fail_fast_error: if cancel.is_cancelled() {
                None
            } else {
                fail_fast_error
            },
        }
    }

    fn dispatch(&self, tasks: &mut JoinSet<RequestRecord>, index: usize) {
        let sender = self.sender.clone();
        let prompts = self.prompts.clone();
        tasks.spawn(async move {
            let prompt = if prompts.is_empty() {
                ""
            } else {
                prompts[index % prompts.len()].as_str()
            };
            let started = Instant::now();
            let result = sender.send(index, prompt).await;
            RequestRecord {
                index,
                latency: started.elapsed(),
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            }
        });
    }

    fn record(
        &self,
        joined: Result<RequestRecord, JoinError>,
        records: &mut Vec<RequestRecord>,
        fail_fast_error: &mut Option<LaunchError>,
        run_token: &CancellationToken,
    ) {
        let record = match joined {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Benchmark request task failed");
                return;
            }
        };

        let result = if record.success { "success" } else { "failure" };
        metrics::counter!("llmlaunch_benchmark_requests_total", "result" => result).increment(1);
        metrics::histogram!("llmlaunch_benchmark_request_duration_seconds", "result" => result)
            .record(record.latency.as_secs_f64());

        if !record.success {
            debug!(index = record.index, error = ?record.error, "Benchmark request failed");
            if self.fail_fast && fail_fast_error.is_none() {
                let reason = record.error.clone().unwrap_or_default();
                warn!(index = record.index, reason = %reason, "Request failed in fail-fast mode, aborting");
                *fail_fast_error = Some(LaunchError::RequestFailure {
                    index: record.index,
                    reason,
                });
                run_token.cancel();
            }
        }
        records.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sleeps `latency`, then fails the requests listed in `fail`.
    struct FakeSender {
        latency: Duration,
        fail: Vec<usize>,
        sent: AtomicUsize,
    }

    impl FakeSender {
        fn new(latency: Duration) -> Self {
            Self {
                latency,
                fail: vec![],
                sent: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RequestSender for FakeSender {
        async fn send(&self, index: usize, _prompt: &str) -> Result<(), LaunchError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            if self.fail.contains(&index) {
                return Err(LaunchError::RequestFailure {
                    index,
                    reason: "HTTP 500 Internal Server Error".to_string(),
                });
            }
            Ok(())
        }
    }

    fn generator(sender: Arc<FakeSender>) -> LoadGenerator {
        LoadGenerator::new(sender, vec!["hello".to_string()]).with_seed(Some(7))
    }

    #[test]
    fn test_distribution_parse() {
        assert_eq!("poisson".parse(), Ok(ArrivalDistribution::Poisson));
        assert_eq!("Uniform".parse(), Ok(ArrivalDistribution::Uniform));
        assert!("gamma".parse::<ArrivalDistribution>().is_err());
    }

    #[test]
    fn test_uniform_gaps() {
        let mut arrivals = ArrivalProcess::new(4.0, ArrivalDistribution::Uniform, None);
        assert_eq!(arrivals.next_gap(), Duration::from_millis(250));
        assert_eq!(arrivals.next_gap(), Duration::from_millis(250));

        let mut burst = ArrivalProcess::new(f64::INFINITY, ArrivalDistribution::Poisson, None);
        assert_eq!(burst.next_gap(), Duration::ZERO);
    }

    #[test]
    fn test_tiny_rate_gap_is_clamped() {
        let mut uniform = ArrivalProcess::new(1e-20, ArrivalDistribution::Uniform, None);
        assert_eq!(uniform.next_gap(), MAX_ARRIVAL_GAP);

        let mut poisson = ArrivalProcess::new(1e-300, ArrivalDistribution::Poisson, Some(1));
        for _ in 0..10 {
            assert!(poisson.next_gap() <= MAX_ARRIVAL_GAP);
        }
    }

    #[test]
    fn test_poisson_mean_gap() {
        let mut arrivals = ArrivalProcess::new(10.0, ArrivalDistribution::Poisson, Some(42));
        let n = 10_000;
        let total: f64 = (0..n).map(|_| arrivals.next_gap().as_secs_f64()).sum();
        let mean = total / n as f64;
        assert!((mean - 0.1).abs() < 0.01, "mean gap {}", mean);
    }

    #[test]
    fn test_percentile() {
        let values: Vec<Duration> = (1..=100).map(Duration::from_millis).collect();
        assert_eq!(percentile(&values, 50.0), Duration::from_millis(50));
        assert_eq!(percentile(&values, 99.0), Duration::from_millis(99));
        assert_eq!(percentile(&values[..1], 90.0), Duration::from_millis(1));
        assert_eq!(percentile(&[], 50.0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arrivals_independent_of_latency() {
        // 50 requests at 10 qps with 30 s latency: scheduling takes ~5 s,
        // so all of them are in flight long before the first completes.
        let sender = Arc::new(FakeSender::new(Duration::from_secs(30)));
        let cancel = CancellationToken::new();

        let run = generator(sender.clone())
            .run(50, 10.0, ArrivalDistribution::Uniform, &cancel)
            .await;

        assert_eq!(run.scheduled, 50);
        assert_eq!(run.records.len(), 50);
        assert!(!run.aborted);
        assert!(run.elapsed >= Duration::from_secs(30));
        assert!(run.elapsed < Duration::from_secs(36), "elapsed {:?}", run.elapsed);

        let summary = run.summary();
        assert_eq!(summary.succeeded, 50);
        assert_eq!(summary.success_rate, 1.0);
        assert!(summary.p50_latency >= Duration::from_secs(30));
        assert!(summary.p50_latency < Duration::from_millis(30_010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_recorded_without_retry() {
        let sender = Arc::new(FakeSender {
            fail: vec![1, 3],
            ..FakeSender::new(Duration::from_millis(10))
        });
        let cancel = CancellationToken::new();

        let run = generator(sender.clone())
            .run(5, 100.0, ArrivalDistribution::Poisson, &cancel)
            .await;

        assert_eq!(sender.sent.load(Ordering::SeqCst), 5);
        assert!(!run.aborted);
        assert!(run.fail_fast_error.is_none());
        let summary = run.summary();
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.succeeded, 3);
        assert!(!run.records[1].success);
        assert!(run.records[1].error.as_deref().unwrap().contains("HTTP 500"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_aborts() {
        let sender = Arc::new(FakeSender {
            fail: vec![0],
            ..FakeSender::new(Duration::from_millis(500))
        });
        let cancel = CancellationToken::new();

        let run = generator(sender.clone())
            .with_fail_fast(true)
            .run(100, 10.0, ArrivalDistribution::Uniform, &cancel)
            .await;

        assert!(run.aborted);
        assert!(run.scheduled < 100);
        assert!(matches!(
            run.fail_fast_error,
            Some(LaunchError::RequestFailure { index: 0, .. })
        ));
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_partial_run() {
        let sender = Arc::new(FakeSender::new(Duration::from_secs(60)));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_050)).await;
            trigger.cancel();
        });

        let run = generator(sender)
            .run(100, 10.0, ArrivalDistribution::Uniform, &cancel)
            .await;

        assert!(run.aborted);
        assert!(run.fail_fast_error.is_none());
        assert_eq!(run.scheduled, 11);
        assert!(run.records.is_empty());
        assert!(run.elapsed < Duration::from_secs(2));
        assert_eq!(run.summary().success_rate, 0.0);
    }
}
