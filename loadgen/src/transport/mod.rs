//! Request execution capability
//!
//! The load core never speaks a protocol itself. Workers hand a [`Request`]
//! to a [`Transport`] and classify whatever comes back:
//! - `Transport` trait for abstracting the client
//! - `HttpTransport` adapter over `reqwest`

mod http;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::plan::Method;

pub use http::HttpTransport;

/// Errors that can occur before a complete response is received
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Transport error: {0}")]
    Other(String),
}

/// A fully materialised request for one iteration
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Path relative to the transport's base address
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
}

/// A fully received response
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: Bytes,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Trait for request transports (HTTP client, in-process mocks)
///
/// `send` must resolve only after the full response body has been read so
/// that the caller's wall-clock measurement covers the whole exchange.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &Request) -> Result<Response, TransportError>;
}
