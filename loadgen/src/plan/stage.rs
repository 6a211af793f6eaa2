//! Stage scheduling: ramp plan to target concurrency

use serde::Serialize;
use std::time::Duration;

/// A time-bounded segment of the run with a target concurrency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    /// How long the stage lasts (always > 0 once validated)
    pub duration: Duration,
    /// Concurrency reached at the end of the stage
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// Run-level state machine
///
/// `Idle → Ramping(i) | Holding(i) → … → Draining(last) → Complete`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "stage", rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Ramping(usize),
    Holding(usize),
    Draining(usize),
    Complete,
}

impl RunPhase {
    pub fn is_complete(&self) -> bool {
        matches!(self, RunPhase::Complete)
    }
}

/// Explicit run state, threaded through the scheduler and the pool on every
/// coordinating tick. Nothing else writes it.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub phase: RunPhase,
    pub stage_index: usize,
    pub stage_elapsed: Duration,
    pub target: usize,
    pub live_workers: usize,
    /// Largest elapsed value seen so far; clock jitter never moves us back
    high_water: Duration,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Elapsed run time as last observed by the scheduler
    pub fn elapsed(&self) -> Duration {
        self.high_water
    }
}

/// Outcome of a scheduler tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Active { stage: usize, target: usize },
    Complete,
}

/// Converts the ordered stage list into a time-varying target
#[derive(Debug, Clone)]
pub struct StageScheduler {
    stages: Vec<Stage>,
    /// Offset of each stage from the start of the run
    starts: Vec<Duration>,
    total: Duration,
}

impl StageScheduler {
    pub fn new(stages: Vec<Stage>) -> Self {
        let mut starts = Vec::with_capacity(stages.len());
        let mut total = Duration::ZERO;
        for stage in &stages {
            starts.push(total);
            total += stage.duration;
        }
        Self {
            stages,
            starts,
            total,
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Sum of all stage durations
    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Highest target any stage asks for
    pub fn peak_target(&self) -> usize {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Stage index and interpolated target at `elapsed`, or `None` once the
    /// run is complete. Stateless; `tick` is the monotonic variant.
    pub fn target_at(&self, elapsed: Duration) -> Option<(usize, usize)> {
        if elapsed >= self.total {
            return None;
        }
        let idx = self.starts.partition_point(|start| *start <= elapsed) - 1;
        Some((idx, self.interpolate(idx, elapsed - self.starts[idx])))
    }

    /// Advance `state` to `elapsed` and return the current target.
    pub fn tick(&self, state: &mut RunState, elapsed: Duration) -> Tick {
        let elapsed = elapsed.max(state.high_water);
        state.high_water = elapsed;

        if state.phase.is_complete() || elapsed >= self.total {
            state.phase = RunPhase::Complete;
            state.target = 0;
            return Tick::Complete;
        }

        let mut idx = state.stage_index;
        while idx + 1 < self.stages.len() && elapsed >= self.starts[idx + 1] {
            idx += 1;
        }

        let stage_elapsed = elapsed - self.starts[idx];
        let target = self.interpolate(idx, stage_elapsed);

        state.stage_index = idx;
        state.stage_elapsed = stage_elapsed;
        state.target = target;
        state.phase = self.phase_for(idx);

        Tick::Active { stage: idx, target }
    }

    fn previous_target(&self, idx: usize) -> usize {
        if idx == 0 { 0 } else { self.stages[idx - 1].target }
    }

    fn interpolate(&self, idx: usize, stage_elapsed: Duration) -> usize {
        let stage = &self.stages[idx];
        let from = self.previous_target(idx) as f64;
        let to = stage.target as f64;
        let fraction = if stage.duration.is_zero() {
            1.0
        } else {
            (stage_elapsed.as_secs_f64() / stage.duration.as_secs_f64()).min(1.0)
        };
        (from + (to - from) * fraction).round().max(0.0) as usize
    }

    fn phase_for(&self, idx: usize) -> RunPhase {
        let from = self.previous_target(idx);
        let to = self.stages[idx].target;
        if from == to {
            RunPhase::Holding(idx)
        } else if to < from && idx + 1 == self.stages.len() {
            RunPhase::Draining(idx)
        } else {
            RunPhase::Ramping(idx)
        }
    }
}
