//! Outcome accounting
//!
//! Workers produce one [`RequestOutcome`] per completed attempt and hand it
//! straight to the shared [`MetricsAggregator`]; nothing is buffered.

mod aggregator;
mod outcome;

pub use aggregator::{
    EndpointSnapshot, LatencySummary, MetricsAggregator, MetricsError, MetricsSnapshot,
};
pub use outcome::{FailureKind, RequestOutcome, ResponseChecks};
