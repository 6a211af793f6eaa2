//! Run orchestration
//!
//! A single coordinating task ticks at a fixed interval, asks the
//! [`StageScheduler`] for the target, resizes the [`WorkerPool`] and
//! publishes a [`LiveStatus`]. When the last stage ends the pool is drained
//! and a [`RunReport`] is built from the final snapshot.

use chrono::Utc;
use metrics::gauge;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, LoadTestConfig};
use crate::plan::{RunPhase, RunState, StageScheduler, Tick, WeightedSelector};
use crate::pool::{PoolOptions, WorkerPool};
use crate::report::RunReport;
use crate::stats::{MetricsAggregator, MetricsError, MetricsSnapshot};
use crate::threshold::ThresholdEvaluator;
use crate::transport::Transport;

/// How often progress is logged at info level
const LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// Point-in-time view of a run, published once per tick
#[derive(Debug, Clone, Default, Serialize)]
pub struct LiveStatus {
    pub run_id: Uuid,
    pub phase: RunPhase,
    pub target: usize,
    pub live_workers: usize,
    pub elapsed_secs: f64,
    pub total_secs: f64,
    pub requests: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub throughput: f64,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    /// Whether every threshold holds on the data so far
    pub thresholds_passing: bool,
}

impl LiveStatus {
    fn from_parts(
        run_id: Uuid,
        state: &RunState,
        total: Duration,
        snapshot: &MetricsSnapshot,
        thresholds_passing: bool,
    ) -> Self {
        Self {
            run_id,
            phase: state.phase,
            target: state.target,
            live_workers: state.live_workers,
            elapsed_secs: state.elapsed().as_secs_f64(),
            total_secs: total.as_secs_f64(),
            requests: snapshot.count,
            errors: snapshot.errors,
            error_rate: snapshot.error_rate(),
            throughput: snapshot.throughput(),
            p95_ms: snapshot.p95(),
            p99_ms: snapshot.p99(),
            thresholds_passing,
        }
    }
}

/// One configured run, ready to start
pub struct LoadTest {
    run_id: Uuid,
    config: LoadTestConfig,
    selector: WeightedSelector,
    scheduler: StageScheduler,
    evaluator: ThresholdEvaluator,
    transport: Arc<dyn Transport>,
    status_tx: watch::Sender<LiveStatus>,
    interrupt: CancellationToken,
}

impl LoadTest {
    pub fn new(config: LoadTestConfig, transport: Arc<dyn Transport>) -> Result<Self, RunError> {
        config.validate()?;
        let selector = WeightedSelector::new(config.endpoints.clone())?;
        let scheduler = StageScheduler::new(config.stages.clone());
        let evaluator = ThresholdEvaluator::new(config.thresholds.clone());

        let run_id = Uuid::new_v4();
        let (status_tx, _) = watch::channel(LiveStatus {
            run_id,
            total_secs: scheduler.total_duration().as_secs_f64(),
            thresholds_passing: true,
            ..LiveStatus::default()
        });

        Ok(Self {
            run_id,
            config,
            selector,
            scheduler,
            evaluator,
            transport,
            status_tx,
            interrupt: CancellationToken::new(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Token that ends the run early; workers drain as after the last stage
    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Receive a fresh [`LiveStatus`] after every tick
    pub fn subscribe(&self) -> watch::Receiver<LiveStatus> {
        self.status_tx.subscribe()
    }

    /// Drive the run to completion
    pub async fn run(self) -> Result<RunReport, RunError> {
        let started_at = Utc::now();
        let seed = self.config.seed.unwrap_or_else(|| rand::rng().random());
        let total = self.scheduler.total_duration();
        info!(
            "Starting run {}: {} stages over {:?}, peak {} workers, seed {}",
            self.run_id,
            self.scheduler.stages().len(),
            total,
            self.scheduler.peak_target(),
            seed
        );

        let metrics = Arc::new(MetricsAggregator::new()?);
        let mut pool = WorkerPool::new(
            self.transport.clone(),
            self.selector.clone(),
            metrics.clone(),
            PoolOptions {
                seed,
                request_timeout: self.config.request_timeout,
                think_time: self.config.think_time,
                headers: self.config.headers.clone(),
                checks: self.config.checks.clone(),
            },
        );

        let start = Instant::now();
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut state = RunState::new();
        let mut peak_workers = 0;
        let mut last_stage = None;
        let mut last_log = start;
        let mut interrupted = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.interrupt.cancelled() => {
                    warn!("Run interrupted at {:?}, stopping early", start.elapsed());
                    interrupted = true;
                    break;
                }
            }
            let elapsed = start.elapsed();

            match self.scheduler.tick(&mut state, elapsed) {
                Tick::Active { stage, target } => {
                    state.live_workers = pool.resize(target);
                    peak_workers = peak_workers.max(state.live_workers);
                    gauge!("loadgen_target_workers").set(target as f64);

                    if last_stage != Some(stage) {
                        info!(
                            "Stage {}/{}: {:?} toward {} workers",
                            stage + 1,
                            self.scheduler.stages().len(),
                            state.phase,
                            self.scheduler.stages()[stage].target
                        );
                        last_stage = Some(stage);
                    }
                }
                Tick::Complete => break,
            }

            let snapshot = metrics.snapshot();
            let passing = self.evaluator.evaluate(&snapshot).passed;
            if last_log.elapsed() >= LOG_INTERVAL {
                last_log = Instant::now();
                info!(
                    "[{:>6.1}s] target={} live={} reqs={} errors={:.2}% p95={} rps={:.1}",
                    elapsed.as_secs_f64(),
                    state.target,
                    state.live_workers,
                    snapshot.count,
                    snapshot.error_rate() * 100.0,
                    snapshot
                        .p95()
                        .map(|v| format!("{:.1}ms", v))
                        .unwrap_or_else(|| "n/a".to_string()),
                    snapshot.throughput()
                );
            }
            self.status_tx.send_replace(LiveStatus::from_parts(
                self.run_id,
                &state,
                total,
                &snapshot,
                passing,
            ));
        }

        info!("All stages complete, draining {} workers", pool.live());
        pool.shutdown().await;
        state.phase = RunPhase::Complete;
        state.target = 0;
        state.live_workers = 0;
        gauge!("loadgen_target_workers").set(0.0);

        let snapshot = metrics.snapshot();
        let verdict = self.evaluator.evaluate(&snapshot);
        self.status_tx.send_replace(LiveStatus::from_parts(
            self.run_id,
            &state,
            total,
            &snapshot,
            verdict.passed,
        ));
        info!(
            "Run {} finished: {} requests, {} failed, thresholds {}",
            self.run_id,
            snapshot.count,
            snapshot.errors,
            if verdict.passed { "passed" } else { "failed" }
        );

        let mut report = RunReport::new(
            self.run_id,
            started_at,
            seed,
            peak_workers,
            &snapshot,
            verdict,
        );
        report.interrupted = interrupted;
        Ok(report)
    }
}
