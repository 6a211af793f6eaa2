//! Streaming metrics aggregation
//!
//! `record` is called from every worker concurrently. Counters are atomics
//! and the latency histogram sits behind one short critical section, so the
//! recording path is O(1) and never waits on the network.
//!
//! Latencies go into an HDR histogram at microsecond resolution with three
//! significant figures: bounded memory, percentile error below 0.1%. Every
//! outcome carries one, so a timed-out request counts at the time it was
//! abandoned.
//!
//! Workers write into a pending histogram. `snapshot` swaps it for an empty
//! one and folds it into the cumulative histogram outside the recording lock.

use dashmap::DashMap;
use hdrhistogram::Histogram;
use metrics::{counter, histogram};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

use super::outcome::{FailureKind, RequestOutcome};

/// Highest latency tracked exactly (1 hour, in microseconds); larger
/// values saturate
const MAX_TRACKABLE_US: u64 = 3_600_000_000;
const SIGNIFICANT_FIGURES: u8 = 3;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to create latency histogram: {0}")]
    Histogram(String),
}

#[derive(Debug, Default)]
struct EndpointCounters {
    count: AtomicU64,
    errors: AtomicU64,
}

/// Thread-safe aggregate of every recorded outcome
#[derive(Debug)]
pub struct MetricsAggregator {
    started: Instant,
    count: AtomicU64,
    errors: AtomicU64,
    transport_errors: AtomicU64,
    timeouts: AtomicU64,
    status_errors: AtomicU64,
    check_failures: AtomicU64,
    /// Written by `record`, drained by `snapshot`
    pending: Mutex<Histogram<u64>>,
    /// Everything drained so far; only `snapshot` takes this lock
    merged: Mutex<Histogram<u64>>,
    endpoints: DashMap<Arc<str>, EndpointCounters>,
}

impl MetricsAggregator {
    /// Create an aggregator whose throughput clock starts now
    pub fn new() -> Result<Self, MetricsError> {
        let latency =
            Histogram::new_with_bounds(1, MAX_TRACKABLE_US, SIGNIFICANT_FIGURES)
                .map_err(|e| MetricsError::Histogram(format!("{:?}", e)))?;

        Ok(Self {
            started: Instant::now(),
            count: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            status_errors: AtomicU64::new(0),
            check_failures: AtomicU64::new(0),
            pending: Mutex::new(Histogram::new_from(&latency)),
            merged: Mutex::new(latency),
            endpoints: DashMap::new(),
        })
    }

    /// Record one completed request. Safe to call from any task.
    pub fn record(&self, outcome: RequestOutcome) {
        let micros = (outcome.latency_ms * 1000.0).round().max(1.0) as u64;
        lock(&self.pending).saturating_record(micros);
        histogram!("loadgen_request_duration_seconds").record(outcome.latency_ms / 1000.0);

        self.count.fetch_add(1, Ordering::Relaxed);
        counter!("loadgen_requests_total").increment(1);

        if let Some(kind) = outcome.failure {
            self.errors.fetch_add(1, Ordering::Relaxed);
            let by_kind = match kind {
                FailureKind::Transport => &self.transport_errors,
                FailureKind::Timeout => &self.timeouts,
                FailureKind::Status => &self.status_errors,
                FailureKind::Check => &self.check_failures,
            };
            by_kind.fetch_add(1, Ordering::Relaxed);
            counter!("loadgen_request_errors_total", "kind" => kind.as_str()).increment(1);
        }

        self.record_endpoint(&outcome);
    }

    fn record_endpoint(&self, outcome: &RequestOutcome) {
        // Fast path: shared shard lock only
        if let Some(counters) = self.endpoints.get(&outcome.endpoint) {
            counters.count.fetch_add(1, Ordering::Relaxed);
            if !outcome.success {
                counters.errors.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        let counters = self.endpoints.entry(outcome.endpoint.clone()).or_default();
        counters.count.fetch_add(1, Ordering::Relaxed);
        if !outcome.success {
            counters.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Total outcomes recorded so far
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Time since the aggregator was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Point-in-time copy for reporting; `record` keeps running meanwhile
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut merged = lock(&self.merged);
        let mut drained = Histogram::new_from(&*merged);
        std::mem::swap(&mut *lock(&self.pending), &mut drained);
        if let Err(e) = merged.add(&drained) {
            warn!("Dropped {} latency samples: {:?}", drained.len(), e);
        }
        let latency = merged.clone();
        drop(merged);

        let mut endpoints: Vec<EndpointSnapshot> = self
            .endpoints
            .iter()
            .map(|entry| EndpointSnapshot {
                name: entry.key().to_string(),
                count: entry.value().count.load(Ordering::Relaxed),
                errors: entry.value().errors.load(Ordering::Relaxed),
            })
            .collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));

        MetricsSnapshot {
            count: self.count.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            status_errors: self.status_errors.load(Ordering::Relaxed),
            check_failures: self.check_failures.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
            endpoints,
            latency,
        }
    }
}

fn lock(histogram: &Mutex<Histogram<u64>>) -> MutexGuard<'_, Histogram<u64>> {
    // A panic mid-record leaves the histogram usable
    histogram.lock().unwrap_or_else(|e| e.into_inner())
}

/// Counters for one endpoint tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointSnapshot {
    pub name: String,
    pub count: u64,
    pub errors: u64,
}

/// Latency figures in milliseconds (`None` without samples)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub avg_ms: Option<f64>,
    pub min_ms: Option<f64>,
    pub med_ms: Option<f64>,
    pub p90_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub max_ms: Option<f64>,
}

/// Immutable copy of the aggregate at one instant
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub count: u64,
    pub errors: u64,
    pub transport_errors: u64,
    pub timeouts: u64,
    pub status_errors: u64,
    pub check_failures: u64,
    /// Run time covered by this snapshot
    pub elapsed: Duration,
    /// Per-endpoint counters, sorted by name
    pub endpoints: Vec<EndpointSnapshot>,
    latency: Histogram<u64>,
}

fn micros_to_ms(us: u64) -> f64 {
    us as f64 / 1000.0
}

impl MetricsSnapshot {
    /// Failed fraction of all requests (0.0 to 1.0)
    pub fn error_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.errors as f64 / self.count as f64
        }
    }

    /// Requests per second over the covered run time
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.count as f64 / secs
        } else {
            0.0
        }
    }

    /// Number of latency samples (one per recorded outcome)
    pub fn latency_samples(&self) -> u64 {
        self.latency.len()
    }

    /// Latency at percentile `p` (0-100) in milliseconds
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.latency.is_empty() {
            return None;
        }
        let quantile = (p / 100.0).clamp(0.0, 1.0);
        Some(micros_to_ms(self.latency.value_at_quantile(quantile)))
    }

    pub fn p50(&self) -> Option<f64> {
        self.percentile(50.0)
    }

    pub fn p95(&self) -> Option<f64> {
        self.percentile(95.0)
    }

    pub fn p99(&self) -> Option<f64> {
        self.percentile(99.0)
    }

    pub fn mean(&self) -> Option<f64> {
        (!self.latency.is_empty()).then(|| self.latency.mean() / 1000.0)
    }

    pub fn min(&self) -> Option<f64> {
        (!self.latency.is_empty()).then(|| micros_to_ms(self.latency.min()))
    }

    pub fn max(&self) -> Option<f64> {
        (!self.latency.is_empty()).then(|| micros_to_ms(self.latency.max()))
    }

    pub fn latency_summary(&self) -> LatencySummary {
        LatencySummary {
            samples: self.latency_samples(),
            avg_ms: self.mean(),
            min_ms: self.min(),
            med_ms: self.p50(),
            p90_ms: self.percentile(90.0),
            p95_ms: self.p95(),
            p99_ms: self.p99(),
            max_ms: self.max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(ms: u64) -> RequestOutcome {
        RequestOutcome::succeeded(Arc::from("/ok"), Duration::from_millis(ms), 200)
    }

    #[test]
    fn test_empty_snapshot() {
        let agg = MetricsAggregator::new().unwrap();
        let snap = agg.snapshot();
        assert_eq!(snap.count, 0);
        assert_eq!(snap.error_rate(), 0.0);
        assert!(snap.p95().is_none());
        assert!(snap.mean().is_none());
        assert!(snap.endpoints.is_empty());
        assert_eq!(snap.latency_summary().samples, 0);
    }

    #[test]
    fn test_counts_and_error_kinds() {
        let agg = MetricsAggregator::new().unwrap();
        let name: Arc<str> = Arc::from("/api/v1/trips/");

        agg.record(ok(5));
        agg.record(RequestOutcome::failed(
            name.clone(),
            Duration::from_millis(2),
            Some(500),
            FailureKind::Status,
        ));
        agg.record(RequestOutcome::failed(
            name.clone(),
            Duration::from_secs(30),
            None,
            FailureKind::Timeout,
        ));
        agg.record(RequestOutcome::failed(
            name,
            Duration::from_millis(1),
            None,
            FailureKind::Transport,
        ));

        let snap = agg.snapshot();
        assert_eq!(snap.count, 4);
        assert_eq!(snap.errors, 3);
        assert_eq!(snap.status_errors, 1);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.transport_errors, 1);
        assert_eq!(snap.check_failures, 0);
        assert!((snap.error_rate() - 0.75).abs() < 1e-9);
        // Failures without a response still carry their elapsed time
        assert_eq!(snap.latency_samples(), 4);
        assert!((snap.max().unwrap() - 30_000.0).abs() < 30.0);

        assert_eq!(
            snap.endpoints,
            vec![
                EndpointSnapshot {
                    name: "/api/v1/trips/".to_string(),
                    count: 3,
                    errors: 3
                },
                EndpointSnapshot {
                    name: "/ok".to_string(),
                    count: 1,
                    errors: 0
                },
            ]
        );
    }

    #[test]
    fn test_percentiles_are_close() {
        let agg = MetricsAggregator::new().unwrap();
        for ms in 1..=100 {
            agg.record(ok(ms));
        }
        let snap = agg.snapshot();

        let p50 = snap.p50().unwrap();
        let p95 = snap.p95().unwrap();
        let p99 = snap.p99().unwrap();
        assert!((p50 - 50.0).abs() < 1.5, "p50 = {}", p50);
        assert!((p95 - 95.0).abs() < 1.5, "p95 = {}", p95);
        assert!((p99 - 99.0).abs() < 1.5, "p99 = {}", p99);
        assert!((snap.min().unwrap() - 1.0).abs() < 0.01);
        assert!((snap.max().unwrap() - 100.0).abs() < 0.1);
        assert!((snap.mean().unwrap() - 50.5).abs() < 0.2);
    }

    #[test]
    fn test_snapshot_is_independent_of_later_records() {
        let agg = MetricsAggregator::new().unwrap();
        agg.record(ok(10));
        let before = agg.snapshot();
        agg.record(ok(1000));

        assert_eq!(before.count, 1);
        assert!((before.max().unwrap() - 10.0).abs() < 0.1);
        assert_eq!(agg.snapshot().count, 2);
    }

    #[test]
    fn test_timeouts_raise_tail_latency() {
        let agg = MetricsAggregator::new().unwrap();
        for _ in 0..90 {
            agg.record(ok(10));
        }
        for _ in 0..10 {
            agg.record(RequestOutcome::failed(
                Arc::from("/ok"),
                Duration::from_secs(30),
                None,
                FailureKind::Timeout,
            ));
        }

        let snap = agg.snapshot();
        assert_eq!(snap.latency_samples(), 100);
        assert!((snap.p50().unwrap() - 10.0).abs() < 0.1);
        assert!(snap.p95().unwrap() > 29_000.0, "p95 = {:?}", snap.p95());
    }

    #[test]
    fn test_repeated_snapshots_accumulate() {
        let agg = MetricsAggregator::new().unwrap();
        agg.record(ok(10));
        agg.record(ok(20));
        assert_eq!(agg.snapshot().latency_samples(), 2);

        agg.record(ok(30));
        let snap = agg.snapshot();
        assert_eq!(snap.latency_samples(), 3);
        assert!((snap.min().unwrap() - 10.0).abs() < 0.1);
        assert!((snap.max().unwrap() - 30.0).abs() < 0.1);

        // Nothing new recorded: the next snapshot sees the same data
        assert_eq!(agg.snapshot().latency_samples(), 3);
    }

    #[test]
    fn test_concurrent_record_from_threads() {
        let agg = Arc::new(MetricsAggregator::new().unwrap());
        let handles: Vec<_> = (0..16)
            .map(|t| {
                let agg = agg.clone();
                std::thread::spawn(move || {
                    for i in 0..5_000u64 {
                        if i % 10 == 0 {
                            agg.record(RequestOutcome::failed(
                                Arc::from(format!("/t{}", t % 4)),
                                Duration::from_millis(1),
                                Some(502),
                                FailureKind::Status,
                            ));
                        } else {
                            agg.record(ok(i % 50 + 1));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = agg.snapshot();
        assert_eq!(snap.count, 80_000);
        assert_eq!(snap.errors, 8_000);
        assert_eq!(snap.latency_samples(), 80_000);
        let per_endpoint: u64 = snap.endpoints.iter().map(|e| e.count).sum();
        assert_eq!(per_endpoint, 80_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_uses_elapsed_time() {
        let agg = MetricsAggregator::new().unwrap();
        for _ in 0..100 {
            agg.record(ok(1));
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        let snap = agg.snapshot();
        assert_eq!(snap.elapsed, Duration::from_secs(10));
        assert!((snap.throughput() - 10.0).abs() < 1e-9);
    }
}
