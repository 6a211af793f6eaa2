//! Worker pool
//!
//! Each worker is a tokio task running select → send → record → think until
//! its cancellation token fires. The pool only ever adds workers or signals
//! the newest ones to stop; a stopping worker finishes the request it has in
//! flight and records it before exiting, so shrinking never loses outcomes.

use metrics::gauge;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::plan::WeightedSelector;
use crate::stats::{MetricsAggregator, RequestOutcome, ResponseChecks};
use crate::transport::{Request, Transport, TransportError};

/// Per-run settings shared by every worker
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Base seed; worker `n` draws from `seed + n`
    pub seed: u64,
    pub request_timeout: Duration,
    pub think_time: Duration,
    pub headers: BTreeMap<String, String>,
    pub checks: ResponseChecks,
}

/// Request for one template, built once per run
struct PreparedRequest {
    name: Arc<str>,
    request: Request,
}

struct Shared {
    transport: Arc<dyn Transport>,
    selector: WeightedSelector,
    requests: Vec<PreparedRequest>,
    metrics: Arc<MetricsAggregator>,
    options: PoolOptions,
}

struct WorkerHandle {
    id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Elastic set of request-issuing workers
pub struct WorkerPool {
    shared: Arc<Shared>,
    root: CancellationToken,
    active: Vec<WorkerHandle>,
    stopping: Vec<WorkerHandle>,
    next_id: u64,
}

impl WorkerPool {
    pub fn new(
        transport: Arc<dyn Transport>,
        selector: WeightedSelector,
        metrics: Arc<MetricsAggregator>,
        options: PoolOptions,
    ) -> Self {
        let requests = selector
            .templates()
            .iter()
            .map(|template| PreparedRequest {
                name: Arc::from(template.name.as_str()),
                request: template.to_request(&options.headers),
            })
            .collect();

        Self {
            shared: Arc::new(Shared {
                transport,
                selector,
                requests,
                metrics,
                options,
            }),
            root: CancellationToken::new(),
            active: Vec::new(),
            stopping: Vec::new(),
            next_id: 0,
        }
    }

    /// Workers that have not been told to stop
    pub fn live(&self) -> usize {
        self.active.len()
    }

    /// Workers told to stop that are still finishing a request
    pub fn stopping(&self) -> usize {
        self.stopping
            .iter()
            .filter(|h| !h.task.is_finished())
            .count()
    }

    /// Converge the live worker count on `target`, returning the new count
    pub fn resize(&mut self, target: usize) -> usize {
        self.stopping.retain(|h| !h.task.is_finished());

        let current = self.active.len();
        if target > current {
            for _ in current..target {
                self.spawn();
            }
            debug!("Scaled pool up {} -> {}", current, target);
        } else if target < current {
            // Newest first
            for handle in self.active.drain(target..).rev() {
                handle.cancel.cancel();
                self.stopping.push(handle);
            }
            debug!("Scaled pool down {} -> {}", current, target);
        }

        gauge!("loadgen_active_workers").set(self.active.len() as f64);
        self.active.len()
    }

    fn spawn(&mut self) {
        let id = self.next_id;
        self.next_id += 1;

        let cancel = self.root.child_token();
        let task = tokio::spawn(run_worker(id, self.shared.clone(), cancel.clone()));
        self.active.push(WorkerHandle { id, cancel, task });
    }

    /// Stop every worker and wait until all in-flight requests are recorded
    pub async fn shutdown(mut self) {
        self.root.cancel();

        let handles = self.active.drain(..).chain(self.stopping.drain(..));
        for handle in handles {
            if let Err(e) = handle.task.await {
                warn!("Worker {} ended abnormally: {}", handle.id, e);
            }
        }
        gauge!("loadgen_active_workers").set(0.0);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

async fn run_worker(id: u64, shared: Arc<Shared>, cancel: CancellationToken) {
    let options = &shared.options;
    let mut rng = ChaCha8Rng::seed_from_u64(options.seed.wrapping_add(id));
    let mut iterations: u64 = 0;
    debug!("Worker {} started", id);

    while !cancel.is_cancelled() {
        let index = shared.selector.select_index(&mut rng);
        let prepared = &shared.requests[index];

        let started = Instant::now();
        let result = match tokio::time::timeout(
            options.request_timeout,
            shared.transport.send(&prepared.request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };
        let outcome = RequestOutcome::classify(
            prepared.name.clone(),
            started.elapsed(),
            &result,
            &options.checks,
        );
        shared.metrics.record(outcome);
        iterations += 1;

        if options.think_time.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(options.think_time) => {}
        }
    }

    debug!("Worker {} stopped after {} requests", id, iterations);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockReply, MockTransport, test_endpoints};

    fn options(seed: u64) -> PoolOptions {
        PoolOptions {
            seed,
            request_timeout: Duration::from_secs(1),
            think_time: Duration::from_millis(10),
            headers: BTreeMap::new(),
            checks: ResponseChecks::default(),
        }
    }

    fn build_pool(
        transport: Arc<MockTransport>,
        opts: PoolOptions,
    ) -> (WorkerPool, Arc<MetricsAggregator>) {
        let metrics = Arc::new(MetricsAggregator::new().unwrap());
        let selector = WeightedSelector::new(test_endpoints()).unwrap();
        let pool = WorkerPool::new(transport, selector, metrics.clone(), opts);
        (pool, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_grows_and_shrinks() {
        let transport = Arc::new(MockTransport::new(Duration::from_millis(5)));
        let (mut pool, metrics) = build_pool(transport.clone(), options(1));

        assert_eq!(pool.resize(5), 5);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(transport.started() >= 5);

        assert_eq!(pool.resize(2), 2);
        assert_eq!(pool.live(), 2);
        assert_eq!(pool.resize(2), 2);

        pool.shutdown().await;
        assert_eq!(metrics.count(), transport.completed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrink_keeps_in_flight_outcomes() {
        let transport = Arc::new(MockTransport::new(Duration::from_millis(100)));
        let (mut pool, metrics) = build_pool(transport.clone(), options(7));

        pool.resize(10);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.started(), 10);
        assert_eq!(transport.completed(), 0);

        pool.resize(2);
        assert_eq!(pool.stopping(), 8);

        tokio::time::sleep(Duration::from_millis(60)).await;
        // The eight stopped workers recorded their request and exited
        assert!(metrics.count() >= 10);
        assert_eq!(pool.stopping(), 0);

        pool.shutdown().await;
        assert_eq!(transport.started(), transport.completed());
        assert_eq!(metrics.count(), transport.completed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_requests_time_out() {
        let transport = Arc::new(MockTransport::new(Duration::from_secs(5)));
        let (mut pool, metrics) = build_pool(transport.clone(), options(3));

        pool.resize(1);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        pool.shutdown().await;

        let snapshot = metrics.snapshot();
        assert!(snapshot.timeouts >= 1);
        assert_eq!(snapshot.errors, snapshot.count);
        // Abandoned requests count at the timeout
        assert_eq!(snapshot.latency_samples(), snapshot.count);
        assert!(snapshot.min().unwrap() >= 999.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_classified() {
        let transport = Arc::new(
            MockTransport::new(Duration::from_millis(2)).with_reply(MockReply::Status(503, b"")),
        );
        let (mut pool, metrics) = build_pool(transport.clone(), options(3));

        pool.resize(3);
        tokio::time::sleep(Duration::from_millis(200)).await;
        pool.shutdown().await;

        let snapshot = metrics.snapshot();
        assert!(snapshot.count > 0);
        assert_eq!(snapshot.status_errors, snapshot.count);
        // Non-2xx responses still carry a latency
        assert_eq!(snapshot.latency_samples(), snapshot.count);

        let refused = Arc::new(
            MockTransport::new(Duration::ZERO).with_reply(MockReply::ConnectionRefused),
        );
        let (mut pool, metrics) = build_pool(refused, options(3));
        pool.resize(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.shutdown().await;

        let snapshot = metrics.snapshot();
        assert!(snapshot.transport_errors > 0);
        assert_eq!(snapshot.endpoints.iter().map(|e| e.errors).sum::<u64>(), snapshot.count);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_seed_replays_selection() {
        async fn paths(seed: u64) -> Vec<String> {
            let transport = Arc::new(MockTransport::new(Duration::from_millis(10)));
            let (mut pool, _) = build_pool(transport.clone(), options(seed));
            pool.resize(1);
            tokio::time::sleep(Duration::from_secs(1)).await;
            pool.shutdown().await;
            transport.paths()
        }

        let first = paths(42).await;
        let second = paths(42).await;
        let n = first.len().min(second.len());
        assert!(n > 20);
        assert_eq!(first[..n], second[..n]);

        let other = paths(43).await;
        let m = n.min(other.len());
        assert_ne!(first[..m], other[..m]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_think_time_still_stops() {
        let transport = Arc::new(MockTransport::new(Duration::from_millis(1)));
        let opts = PoolOptions {
            think_time: Duration::ZERO,
            ..options(5)
        };
        let (mut pool, metrics) = build_pool(transport.clone(), opts);

        pool.resize(4);
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.shutdown().await;
        assert_eq!(metrics.count(), transport.completed());
    }
}
