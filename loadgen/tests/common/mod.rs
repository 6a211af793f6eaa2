//! Common Test Utilities for Integration Tests
//!
//! An in-process target service for the HTTP transport and a clock-driven
//! mock transport for paused-time runs.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    http::{HeaderMap, StatusCode},
    routing::get,
};
use loadgen::plan::{EndpointTemplate, Method};
use loadgen::transport::{Request, Response, Transport, TransportError};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Hit counters for the target service
#[derive(Debug, Default)]
pub struct TargetHits {
    pub list: AtomicU64,
    pub create: AtomicU64,
    pub json_bodies: AtomicU64,
}

impl TargetHits {
    pub fn total(&self) -> u64 {
        self.list.load(Ordering::SeqCst) + self.create.load(Ordering::SeqCst)
    }
}

/// Create the target router
pub fn create_target_app(hits: Arc<TargetHits>) -> Router {
    let list_hits = hits.clone();
    let create_hits = hits;

    Router::new()
        .route(
            "/api/v1/trips/",
            get(move || {
                let hits = list_hits.clone();
                async move {
                    hits.list.fetch_add(1, Ordering::SeqCst);
                    Json(json!({ "results": [], "count": 0 }))
                }
            }),
        )
        .route(
            "/api/v1/patients/",
            axum::routing::post(move |headers: HeaderMap, body: Bytes| {
                let hits = create_hits.clone();
                async move {
                    hits.create.fetch_add(1, Ordering::SeqCst);
                    let is_json = headers
                        .get("content-type")
                        .is_some_and(|v| v == "application/json");
                    if is_json && serde_json::from_slice::<Value>(&body).is_ok() {
                        hits.json_bodies.fetch_add(1, Ordering::SeqCst);
                    }
                    (StatusCode::CREATED, Json(json!({ "id": 1 })))
                }
            }),
        )
        .route(
            "/unavailable",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "busy") }),
        )
        .route("/empty", get(|| async { StatusCode::OK }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                "late"
            }),
        )
}

/// Bind the target on an ephemeral port and serve it in the background
pub async fn spawn_target() -> (String, Arc<TargetHits>) {
    let hits = Arc::new(TargetHits::default());
    let app = create_target_app(hits.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), hits)
}

/// An address nothing listens on
pub async fn closed_port_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

/// The endpoint mix served by [`create_target_app`]
pub fn target_endpoints() -> Vec<EndpointTemplate> {
    vec![
        EndpointTemplate::new(Method::Get, "/api/v1/trips/", 3.0).with_name("list_trips"),
        EndpointTemplate::new(Method::Post, "/api/v1/patients/", 1.0)
            .with_name("create_patient")
            .with_payload(json!({ "test": true })),
    ]
}

/// Transport answering 200 after a fixed delay on the tokio clock
pub struct SleepTransport {
    latency: Duration,
    completed: AtomicU64,
}

impl SleepTransport {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            completed: AtomicU64::new(0),
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for SleepTransport {
    async fn send(&self, _request: &Request) -> Result<Response, TransportError> {
        tokio::time::sleep(self.latency).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(Response {
            status: 200,
            body: Bytes::from_static(b"{}"),
        })
    }
}
