//! Test Utilities Module
//!
//! In-process transports for driving the pool and runner without a network.
//! This module is only compiled when running tests.

#![cfg(test)]

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::plan::{EndpointTemplate, Method};
use crate::transport::{Request, Response, Transport, TransportError};

/// What a [`MockTransport`] answers with
#[derive(Debug, Clone)]
pub enum MockReply {
    Status(u16, &'static [u8]),
    ConnectionRefused,
}

/// Transport that sleeps for a fixed latency on the tokio clock and answers
/// with a canned reply
pub struct MockTransport {
    latency: Duration,
    reply: MockReply,
    started: AtomicU64,
    completed: AtomicU64,
    paths: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            reply: MockReply::Status(200, b"{\"ok\":true}"),
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            paths: Mutex::new(Vec::new()),
        }
    }

    pub fn with_reply(mut self, reply: MockReply) -> Self {
        self.reply = reply;
        self
    }

    /// Requests that entered `send`
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    /// Requests whose `send` resolved
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Paths in the order they were sent
    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &Request) -> Result<Response, TransportError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.paths.lock().unwrap().push(request.path.clone());

        tokio::time::sleep(self.latency).await;

        self.completed.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            MockReply::Status(status, body) => Ok(Response {
                status: *status,
                body: Bytes::from_static(body),
            }),
            MockReply::ConnectionRefused => {
                Err(TransportError::Connect("connection refused".to_string()))
            }
        }
    }
}

/// The two-endpoint mix used across tests
pub fn test_endpoints() -> Vec<EndpointTemplate> {
    vec![
        EndpointTemplate::new(Method::Get, "/api/v1/trips/", 3.0).with_name("list_trips"),
        EndpointTemplate::new(Method::Post, "/api/v1/patients/", 1.0)
            .with_name("create_patient")
            .with_payload(serde_json::json!({ "test": true })),
    ]
}
