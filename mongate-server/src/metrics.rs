//! Prometheus metrics for the mongate gateway.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` and readiness at `/healthz`

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Stage duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
];

/// Prometheus metrics for the gateway.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total client connections accepted.
    pub connections_total: Counter,
    /// Currently open client connections.
    pub connections_active: Gauge,
    /// Messages received by opcode.
    pub messages_total: CounterVec,
    /// Commands dispatched by command name.
    pub commands_total: CounterVec,
    /// Inline error replies by code name.
    pub errors_total: CounterVec,
    /// Time spent inside each pipeline stage, downstream stages included.
    pub stage_duration: HistogramVec,
    /// Cursors added to the cursor cache.
    pub cursors_opened_total: Counter,
    /// Cursors removed by TTL expiry.
    pub cursors_expired_total: Counter,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = Counter::with_opts(Opts::new(
            "mongate_client_accept_total",
            "Total number of accepted client connections",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "mongate_client_connections_open",
            "Number of currently open client connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        // Messages and commands
        let messages_total = CounterVec::new(
            Opts::new("mongate_client_message_total", "Total messages by opcode"),
            &["opcode"],
        )?;
        registry.register(Box::new(messages_total.clone()))?;

        let commands_total = CounterVec::new(
            Opts::new("mongate_client_command_total", "Total commands by name"),
            &["command"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("mongate_errors_total", "Total inline error replies by code"),
            &["code"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        // Pipeline
        let stage_duration = HistogramVec::new(
            HistogramOpts::new(
                "mongate_plugins_duration_seconds",
                "Pipeline stage duration in seconds by position, stage and status",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["position", "stage", "status"],
        )?;
        registry.register(Box::new(stage_duration.clone()))?;

        // Cursors
        let cursors_opened_total = Counter::with_opts(Opts::new(
            "mongate_cursors_opened_total",
            "Total cursors added to the cursor cache",
        ))?;
        registry.register(Box::new(cursors_opened_total.clone()))?;

        let cursors_expired_total = Counter::with_opts(Opts::new(
            "mongate_cursors_expired_total",
            "Total cursors killed after idling past the cursor timeout",
        ))?;
        registry.register(Box::new(cursors_expired_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            messages_total,
            commands_total,
            errors_total,
            stage_duration,
            cursors_opened_total,
            cursors_expired_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Readiness flag reported by `/healthz`.
#[derive(Debug, Clone, Default)]
pub struct Health {
    ready: Arc<AtomicBool>,
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// Runs the HTTP metrics server until `shutdown` is cancelled.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    health: Health,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        let health = health.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let health = health.clone();
                                async move { handle_request(req, metrics, health).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.cancelled() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    health: Health,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => {
                let mut response = text_response(StatusCode::OK, body);
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static(
                        "text/plain; version=0.0.4; charset=utf-8",
                    ),
                );
                response
            }
            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        "/health" | "/healthz" => {
            if health.is_ready() {
                text_response(StatusCode::OK, "OK")
            } else {
                text_response(StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}
