//! Per-request outcome and response classification

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::transport::{Response, TransportError};

/// Why a request counted as failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection refused, reset, DNS, protocol error
    Transport,
    /// Per-request timeout elapsed before the response completed
    Timeout,
    /// Response arrived with a non-2xx status
    Status,
    /// 2xx response that failed a response check
    Check,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transport => "transport",
            FailureKind::Timeout => "timeout",
            FailureKind::Status => "status",
            FailureKind::Check => "check",
        }
    }
}

/// Checks applied to every 2xx response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseChecks {
    /// Count an empty body as a failure
    #[serde(default)]
    pub require_body: bool,
    /// Count responses slower than this as failures
    #[serde(default, with = "humantime_serde_opt")]
    pub max_latency: Option<Duration>,
}

/// One completed request attempt
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    /// Endpoint tag
    pub endpoint: Arc<str>,
    /// Wall-clock time from send to full response (or failure)
    pub latency_ms: f64,
    /// Status code, if a response was received
    pub status: Option<u16>,
    pub success: bool,
    pub failure: Option<FailureKind>,
    pub timestamp: DateTime<Utc>,
}

impl RequestOutcome {
    pub fn succeeded(endpoint: Arc<str>, latency: Duration, status: u16) -> Self {
        Self {
            endpoint,
            latency_ms: latency.as_secs_f64() * 1000.0,
            status: Some(status),
            success: true,
            failure: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        endpoint: Arc<str>,
        latency: Duration,
        status: Option<u16>,
        kind: FailureKind,
    ) -> Self {
        Self {
            endpoint,
            latency_ms: latency.as_secs_f64() * 1000.0,
            status,
            success: false,
            failure: Some(kind),
            timestamp: Utc::now(),
        }
    }

    /// Classify the result of one `send`
    pub fn classify(
        endpoint: Arc<str>,
        latency: Duration,
        result: &Result<Response, TransportError>,
        checks: &ResponseChecks,
    ) -> Self {
        match result {
            Ok(resp) if !resp.is_success() => {
                Self::failed(endpoint, latency, Some(resp.status), FailureKind::Status)
            }
            Ok(resp) => {
                let empty = checks.require_body && resp.body.is_empty();
                let slow = checks.max_latency.is_some_and(|max| latency > max);
                if empty || slow {
                    Self::failed(endpoint, latency, Some(resp.status), FailureKind::Check)
                } else {
                    Self::succeeded(endpoint, latency, resp.status)
                }
            }
            Err(TransportError::Timeout) => {
                Self::failed(endpoint, latency, None, FailureKind::Timeout)
            }
            Err(_) => Self::failed(endpoint, latency, None, FailureKind::Transport),
        }
    }
}

/// `Option<Duration>` as a human-readable string (`"500ms"`)
mod humantime_serde_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
