//! Prometheus metrics for the tunnel edge.
//!
//! Tracks registered sessions and the outcome of relayed requests.
use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

lazy_static! {
    /// Sessions currently present in the registry
    pub static ref ACTIVE_SESSIONS: Gauge = register_gauge!(
        "burrow_active_sessions",
        "Number of clients with a live control channel"
    )
    .unwrap();

    /// Registrations by result
    pub static ref REGISTRATIONS_TOTAL: CounterVec = register_counter_vec!(
        "burrow_registrations_total",
        "Control channel registrations",
        &["result"]  // result: registered|superseded|rejected
    )
    .unwrap();

    /// Public requests by outcome
    pub static ref EDGE_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "burrow_edge_requests_total",
        "Public HTTP requests handled by the edge",
        &["outcome"]  // outcome: relayed|session_not_found|timeout|channel|busy|protocol|superseded
    )
    .unwrap();

    /// Time from receiving a public request to answering it
    pub static ref RELAY_DURATION_MS: HistogramVec = register_histogram_vec!(
        "burrow_relay_duration_ms",
        "Duration of relayed requests in milliseconds",
        &["outcome"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0]
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn set_active_sessions(count: usize) {
    ACTIVE_SESSIONS.set(count as f64);
}

pub fn record_registration(result: &str) {
    REGISTRATIONS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_edge_request(outcome: &str, duration_ms: f64) {
    EDGE_REQUESTS_TOTAL.with_label_values(&[outcome]).inc();
    RELAY_DURATION_MS
        .with_label_values(&[outcome])
        .observe(duration_ms);
}

/// Serves `GET /metrics` on its own listener.
pub struct MetricsServer {
    listener: TcpListener,
}

impl MetricsServer {
    pub fn new(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        info!("Metrics listening on http://{}/metrics", self.listener.local_addr()?);

        loop {
            let (stream, _) = tokio::select! {
                accepted = self.listener.accept() => accepted?,
                _ = shutdown.cancelled() => return Ok(()),
            };
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|req| async move { Ok::<_, Infallible>(handle_metrics(&req)) });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Metrics connection error: {}", e);
                }
            });
        }
    }
}

fn handle_metrics<B>(req: &Request<B>) -> Response<Full<Bytes>> {
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        let mut response = Response::new(Full::new(Bytes::from_static(b"not found")));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    }

    let mut response = Response::new(Full::new(Bytes::from(collect_metrics())));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}
