//! Load test configuration
//!
//! The run plan (stages, endpoint mix, thresholds) lives in a JSON file named
//! by `LOADGEN_CONFIG`. A handful of environment variables override the file
//! so the same plan can be pointed at another target. See `plans/` for
//! examples.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::plan::{EndpointTemplate, Stage, WeightedSelector};
use crate::stats::ResponseChecks;
use crate::threshold::ThresholdRule;

/// Errors that stop a run before it starts
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Stage {index}: duration must be greater than zero")]
    ZeroDurationStage { index: usize },

    #[error("Stage {index}: target must not be negative (got {target})")]
    NegativeTarget { index: usize, target: i64 },

    #[error("No endpoints configured")]
    NoEndpoints,

    #[error("Endpoint {endpoint}: weight must be a positive number (got {weight})")]
    InvalidWeight { endpoint: String, weight: f64 },

    #[error("Total endpoint weight must be greater than zero")]
    ZeroTotalWeight,

    #[error("Invalid threshold '{rule}': {reason}")]
    InvalidThreshold { rule: String, reason: String },

    #[error("Invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("Invalid base URL '{0}'")]
    InvalidBaseUrl(String),

    #[error("Invalid status address '{0}'")]
    InvalidStatusAddr(String),

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Stage as written in the plan file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawStage {
    /// Human duration, e.g. `"2m"` or `"30s"`
    pub duration: String,
    pub target: i64,
}

/// Plan file contents before validation
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub stages: Vec<RawStage>,
    #[serde(default)]
    pub endpoints: Vec<EndpointTemplate>,
    #[serde(default = "default_threshold_exprs")]
    pub thresholds: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub request_timeout: Option<String>,
    #[serde(default)]
    pub think_time: Option<String>,
    #[serde(default)]
    pub tick_interval: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub checks: ResponseChecks,
    #[serde(default)]
    pub status_addr: Option<String>,
}

fn default_threshold_exprs() -> Vec<String> {
    vec![
        "p(95)<200".to_string(),
        "p(99)<500".to_string(),
        "rate<0.01".to_string(),
    ]
}

fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|e| ConfigError::InvalidDuration {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_status_addr(value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidStatusAddr(value.to_string()))
}

/// Validated configuration for one run
#[derive(Debug, Clone)]
pub struct LoadTestConfig {
    /// Target address every endpoint path is resolved against
    pub base_url: String,
    pub stages: Vec<Stage>,
    pub endpoints: Vec<EndpointTemplate>,
    pub thresholds: Vec<ThresholdRule>,
    /// Seed for endpoint selection; drawn at start when `None`
    pub seed: Option<u64>,
    /// Upper bound for a single request
    pub request_timeout: Duration,
    /// Delay each worker waits between requests
    pub think_time: Duration,
    /// Period of the coordinating tick
    pub tick_interval: Duration,
    /// Headers sent with every request
    pub headers: BTreeMap<String, String>,
    pub checks: ResponseChecks,
    /// Where to serve live status, if anywhere
    pub status_addr: Option<SocketAddr>,
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            stages: Vec::new(),
            endpoints: Vec::new(),
            thresholds: default_threshold_exprs()
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            seed: None,
            request_timeout: Duration::from_secs(30),
            think_time: Duration::from_millis(10),
            tick_interval: Duration::from_secs(1),
            headers,
            checks: ResponseChecks::default(),
            status_addr: None,
        }
    }
}

impl LoadTestConfig {
    /// Check every invariant the run relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.duration.is_zero() {
                return Err(ConfigError::ZeroDurationStage { index });
            }
        }
        WeightedSelector::new(self.endpoints.clone())?;

        match reqwest::Url::parse(&self.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => return Err(ConfigError::InvalidBaseUrl(self.base_url.clone())),
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroInterval("request_timeout"));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("tick_interval"));
        }
        Ok(())
    }

    /// Sum of all stage durations
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }
}

impl PlanFile {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Convert into a validated config, filling unset fields with defaults
    pub fn into_config(self) -> Result<LoadTestConfig, ConfigError> {
        let mut config = LoadTestConfig::default();

        if let Some(base_url) = self.base_url {
            config.base_url = base_url;
        }

        config.stages = self
            .stages
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                if raw.target < 0 {
                    return Err(ConfigError::NegativeTarget {
                        index,
                        target: raw.target,
                    });
                }
                Ok(Stage::new(parse_duration(&raw.duration)?, raw.target as usize))
            })
            .collect::<Result<_, _>>()?;

        config.endpoints = self
            .endpoints
            .into_iter()
            .map(|mut endpoint| {
                if endpoint.name.is_empty() {
                    endpoint.name = endpoint.path.clone();
                }
                endpoint
            })
            .collect();

        config.thresholds = self
            .thresholds
            .iter()
            .map(|expr| expr.parse())
            .collect::<Result<_, _>>()?;

        config.seed = self.seed;
        if let Some(raw) = &self.request_timeout {
            config.request_timeout = parse_duration(raw)?;
        }
        if let Some(raw) = &self.think_time {
            config.think_time = parse_duration(raw)?;
        }
        if let Some(raw) = &self.tick_interval {
            config.tick_interval = parse_duration(raw)?;
        }
        config.headers.extend(self.headers);
        config.checks = self.checks;
        if let Some(raw) = &self.status_addr {
            config.status_addr = Some(parse_status_addr(raw)?);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Process configuration: where the plan lives and what the environment
/// overrides
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the JSON plan file
    pub plan_path: PathBuf,
    /// Overrides `base_url`
    pub base_url: Option<String>,
    /// Overrides `seed`
    pub seed: Option<u64>,
    /// Overrides `status_addr`
    pub status_addr: Option<String>,
    /// Overrides `request_timeout`
    pub request_timeout: Option<Duration>,
    /// Overrides `think_time`
    pub think_time: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plan_path: PathBuf::from("loadtest.json"),
            base_url: None,
            seed: None,
            status_addr: None,
            request_timeout: None,
            think_time: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = env::var("LOADGEN_CONFIG")
            && !path.is_empty()
        {
            config.plan_path = PathBuf::from(path);
        }
        if let Ok(url) = env::var("BASE_URL")
            && !url.is_empty()
        {
            config.base_url = Some(url);
        }
        if let Ok(val) = env::var("LOADGEN_SEED") {
            match val.parse() {
                Ok(seed) => config.seed = Some(seed),
                Err(_) => warn!("Ignoring LOADGEN_SEED={:?}: not a u64", val),
            }
        }
        if let Ok(addr) = env::var("LOADGEN_STATUS_ADDR")
            && !addr.is_empty()
        {
            config.status_addr = Some(addr);
        }
        if let Ok(val) = env::var("LOADGEN_REQUEST_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => config.request_timeout = Some(Duration::from_secs(secs)),
                Err(_) => warn!("Ignoring LOADGEN_REQUEST_TIMEOUT_SECS={:?}", val),
            }
        }
        if let Ok(val) = env::var("LOADGEN_THINK_TIME_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.think_time = Some(Duration::from_millis(ms)),
                Err(_) => warn!("Ignoring LOADGEN_THINK_TIME_MS={:?}", val),
            }
        }

        config
    }

    /// Read the plan file and apply environment overrides
    pub fn load(&self) -> Result<LoadTestConfig, ConfigError> {
        let plan = PlanFile::from_path(&self.plan_path)?;
        self.apply(plan)
    }

    /// Apply overrides to an already parsed plan
    pub fn apply(&self, mut plan: PlanFile) -> Result<LoadTestConfig, ConfigError> {
        if let Some(url) = &self.base_url {
            plan.base_url = Some(url.clone());
        }
        if let Some(seed) = self.seed {
            plan.seed = Some(seed);
        }
        if let Some(addr) = &self.status_addr {
            plan.status_addr = Some(addr.clone());
        }

        let mut config = plan.into_config()?;
        if let Some(timeout) = self.request_timeout {
            config.request_timeout = timeout;
        }
        if let Some(think_time) = self.think_time {
            config.think_time = think_time;
        }
        config.validate()?;
        Ok(config)
    }
}
