//! Run plan module
//!
//! This module provides:
//! - `Stage` and `StageScheduler` for turning a ramp plan into a target
//! - `RunState` and `RunPhase`, the explicit run-level state
//! - `EndpointTemplate` and `WeightedSelector` for the request mix

mod endpoint;
mod stage;

pub use endpoint::{EndpointTemplate, Method, WeightedSelector};
pub use stage::{RunPhase, RunState, Stage, StageScheduler, Tick};
