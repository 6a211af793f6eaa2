//! Weighted endpoint mix

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::ConfigError;
use crate::transport::Request;

/// Request method of an endpoint template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        };
        f.write_str(s)
    }
}

/// One entry of the request mix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointTemplate {
    /// Tag used for per-endpoint metrics (the path when left empty)
    #[serde(default)]
    pub name: String,
    pub method: Method,
    /// Path relative to the base URL
    pub path: String,
    /// Relative share of iterations (positive, finite)
    pub weight: f64,
    /// Optional JSON body sent with every request to this endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl EndpointTemplate {
    /// Create a template tagged by its path
    pub fn new(method: Method, path: impl Into<String>, weight: f64) -> Self {
        let path = path.into();
        Self {
            name: path.clone(),
            method,
            path,
            weight,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Materialise the request this template sends
    pub fn to_request(&self, headers: &BTreeMap<String, String>) -> Request {
        Request {
            method: self.method,
            path: self.path.clone(),
            headers: headers.clone(),
            body: self
                .payload
                .as_ref()
                .map(|payload| Bytes::from(payload.to_string())),
        }
    }
}

/// Picks templates with probability `weight / total_weight`
///
/// Draws `u` uniformly in `[0, total)` and returns the first template, in
/// definition order, whose cumulative weight exceeds `u`.
#[derive(Debug, Clone)]
pub struct WeightedSelector {
    templates: Vec<EndpointTemplate>,
    cumulative: Vec<f64>,
    total: f64,
}

impl WeightedSelector {
    pub fn new(templates: Vec<EndpointTemplate>) -> Result<Self, ConfigError> {
        if templates.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        let mut cumulative = Vec::with_capacity(templates.len());
        let mut total = 0.0;
        for template in &templates {
            if !template.weight.is_finite() || template.weight <= 0.0 {
                return Err(ConfigError::InvalidWeight {
                    endpoint: template.name.clone(),
                    weight: template.weight,
                });
            }
            total += template.weight;
            cumulative.push(total);
        }
        if !total.is_finite() || total <= 0.0 {
            return Err(ConfigError::ZeroTotalWeight);
        }

        Ok(Self {
            templates,
            cumulative,
            total,
        })
    }

    pub fn templates(&self) -> &[EndpointTemplate] {
        &self.templates
    }

    pub fn total_weight(&self) -> f64 {
        self.total
    }

    /// Pick a template
    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> &EndpointTemplate {
        &self.templates[self.select_index(rng)]
    }

    /// Pick a template, returning its position in definition order
    pub fn select_index<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let draw = rng.random_range(0.0..self.total);
        self.index_for(draw)
    }

    fn index_for(&self, draw: f64) -> usize {
        self.cumulative
            .iter()
            .position(|boundary| *boundary > draw)
            // Float rounding can leave the draw on the last boundary
            .unwrap_or(self.cumulative.len() - 1)
    }
}
