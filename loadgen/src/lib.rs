//! Loadgen Library
//!
//! Staged load generation against an HTTP service: a stage plan drives the
//! worker count, workers pick weighted endpoints and record every outcome,
//! and thresholds turn the aggregate into a pass/fail verdict.

pub mod config;
pub mod plan;
pub mod pool;
pub mod report;
pub mod runner;
pub mod stats;
pub mod status;
pub mod threshold;
pub mod transport;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use config::{Config, ConfigError, LoadTestConfig, PlanFile};
pub use plan::{EndpointTemplate, Method, RunPhase, Stage, StageScheduler, WeightedSelector};
pub use pool::{PoolOptions, WorkerPool};
pub use report::RunReport;
pub use runner::{LiveStatus, LoadTest, RunError};
pub use stats::{MetricsAggregator, MetricsSnapshot, RequestOutcome};
pub use threshold::{ThresholdEvaluator, ThresholdRule, Verdict};
pub use transport::{HttpTransport, Transport, TransportError};
