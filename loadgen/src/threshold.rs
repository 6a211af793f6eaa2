//! Pass/fail thresholds
//!
//! Rules are written the way k6 writes them: `p(95)<200`, `rate<0.01`,
//! `avg<=120`, `throughput>50`. Latency values are milliseconds, rates are
//! fractions. Evaluation only reads a [`MetricsSnapshot`], so it can run on
//! every tick as well as at the end of the run.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::config::ConfigError;
use crate::stats::MetricsSnapshot;

/// Aggregate a rule is checked against
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdMetric {
    /// Latency percentile (0-100), milliseconds
    Percentile(f64),
    /// Mean latency, milliseconds
    Avg,
    Min,
    Max,
    /// Failed fraction of requests
    ErrorRate,
    /// Requests per second
    Throughput,
    /// Total requests
    Count,
}

impl ThresholdMetric {
    fn is_latency(&self) -> bool {
        matches!(
            self,
            ThresholdMetric::Percentile(_)
                | ThresholdMetric::Avg
                | ThresholdMetric::Min
                | ThresholdMetric::Max
        )
    }

    fn observe(&self, snapshot: &MetricsSnapshot) -> Option<f64> {
        match self {
            ThresholdMetric::Percentile(p) => snapshot.percentile(*p),
            ThresholdMetric::Avg => snapshot.mean(),
            ThresholdMetric::Min => snapshot.min(),
            ThresholdMetric::Max => snapshot.max(),
            ThresholdMetric::ErrorRate => Some(snapshot.error_rate()),
            ThresholdMetric::Throughput => Some(snapshot.throughput()),
            ThresholdMetric::Count => Some(snapshot.count as f64),
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        let name = raw.trim().to_ascii_lowercase();
        let metric = match name.as_str() {
            "avg" | "mean" => ThresholdMetric::Avg,
            "min" => ThresholdMetric::Min,
            "max" => ThresholdMetric::Max,
            "med" | "median" => ThresholdMetric::Percentile(50.0),
            "rate" | "error_rate" => ThresholdMetric::ErrorRate,
            "throughput" | "rps" => ThresholdMetric::Throughput,
            "count" => ThresholdMetric::Count,
            _ => {
                let digits = name
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .or_else(|| name.strip_prefix('p'))?;
                let p: f64 = digits.trim().parse().ok()?;
                if !(0.0..=100.0).contains(&p) {
                    return None;
                }
                ThresholdMetric::Percentile(p)
            }
        };
        Some(metric)
    }
}

impl fmt::Display for ThresholdMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdMetric::Percentile(p) => write!(f, "p({})", p),
            ThresholdMetric::Avg => f.write_str("avg"),
            ThresholdMetric::Min => f.write_str("min"),
            ThresholdMetric::Max => f.write_str("max"),
            ThresholdMetric::ErrorRate => f.write_str("rate"),
            ThresholdMetric::Throughput => f.write_str("throughput"),
            ThresholdMetric::Count => f.write_str("count"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparator {
    pub fn holds(&self, observed: f64, limit: f64) -> bool {
        match self {
            Comparator::Lt => observed < limit,
            Comparator::Le => observed <= limit,
            Comparator::Gt => observed > limit,
            Comparator::Ge => observed >= limit,
            Comparator::Eq => observed == limit,
            Comparator::Ne => observed != limit,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }
}

/// One `(metric, comparator, value)` rule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdRule {
    pub metric: ThresholdMetric,
    pub comparator: Comparator,
    pub value: f64,
}

impl ThresholdRule {
    pub fn new(metric: ThresholdMetric, comparator: Comparator, value: f64) -> Self {
        Self {
            metric,
            comparator,
            value,
        }
    }
}

impl fmt::Display for ThresholdRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.metric, self.comparator.as_str(), self.value)
    }
}

impl FromStr for ThresholdRule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidThreshold {
            rule: s.to_string(),
            reason: reason.to_string(),
        };

        let op_start = s
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| invalid("missing comparator"))?;
        let rest = &s[op_start..];
        let (comparator, op_len) = if rest.starts_with("<=") {
            (Comparator::Le, 2)
        } else if rest.starts_with(">=") {
            (Comparator::Ge, 2)
        } else if rest.starts_with("==") {
            (Comparator::Eq, 2)
        } else if rest.starts_with("!=") {
            (Comparator::Ne, 2)
        } else if rest.starts_with('<') {
            (Comparator::Lt, 1)
        } else if rest.starts_with('>') {
            (Comparator::Gt, 1)
        } else {
            return Err(invalid("unknown comparator"));
        };

        let metric = ThresholdMetric::parse(&s[..op_start])
            .ok_or_else(|| invalid("unknown metric"))?;
        let value: f64 = rest[op_len..]
            .trim()
            .parse()
            .map_err(|_| invalid("value is not a number"))?;
        if !value.is_finite() {
            return Err(invalid("value is not finite"));
        }

        Ok(Self::new(metric, comparator, value))
    }
}

impl Serialize for ThresholdRule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ThresholdRule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Result of one rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleResult {
    pub rule: ThresholdRule,
    /// Observed value, `None` for latency rules without samples
    pub observed: Option<f64>,
    pub passed: bool,
}

/// Per-rule results plus the overall verdict (AND of all rules)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub results: Vec<RuleResult>,
    pub passed: bool,
}

impl Verdict {
    pub fn failed_rules(&self) -> impl Iterator<Item = &RuleResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

/// Evaluates a fixed rule set against metric snapshots
#[derive(Debug, Clone, Default)]
pub struct ThresholdEvaluator {
    rules: Vec<ThresholdRule>,
}

impl ThresholdEvaluator {
    pub fn new(rules: Vec<ThresholdRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }

    /// Evaluate every rule. A latency rule with no samples (nothing recorded
    /// yet) passes.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Verdict {
        let results: Vec<RuleResult> = self
            .rules
            .iter()
            .map(|rule| {
                let observed = rule.metric.observe(snapshot);
                let passed = match observed {
                    Some(value) => rule.comparator.holds(value, rule.value),
                    None => rule.metric.is_latency(),
                };
                RuleResult {
                    rule: *rule,
                    observed,
                    passed,
                }
            })
            .collect();

        let passed = results.iter().all(|r| r.passed);
        Verdict { results, passed }
    }
}
