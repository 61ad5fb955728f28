//! Prometheus metrics for the nestdb server.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use crate::error::ServerError;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Command duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[
    0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5,
];

/// Prometheus metrics for the nestdb server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently open connections.
    pub connections_active: Gauge,
    /// Connections closed because the limit was reached.
    pub connections_rejected_total: Counter,
    /// Commands by action.
    pub commands_total: CounterVec,
    /// Failed commands by error kind.
    pub errors_total: CounterVec,
    /// Command duration histogram by action.
    pub command_duration: HistogramVec,
    /// Current number of event subscriptions.
    pub subscriptions_active: Gauge,
    /// Event notifications queued for delivery.
    pub events_delivered_total: Counter,
    /// Event notifications dropped because a connection's queue was full.
    pub events_dropped_total: Counter,
    /// Keys removed by the expiry sweeper.
    pub keys_expired_total: Counter,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = Counter::with_opts(Opts::new(
            "nestdb_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "nestdb_connections_active",
            "Number of currently open connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let connections_rejected_total = Counter::with_opts(Opts::new(
            "nestdb_connections_rejected_total",
            "Connections closed because the connection limit was reached",
        ))?;
        registry.register(Box::new(connections_rejected_total.clone()))?;

        // Commands
        let commands_total = CounterVec::new(
            Opts::new("nestdb_commands_total", "Total commands by action"),
            &["action"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("nestdb_errors_total", "Total failed commands by error kind"),
            &["kind"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let command_duration = HistogramVec::new(
            HistogramOpts::new(
                "nestdb_command_duration_seconds",
                "Command duration in seconds by action",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["action"],
        )?;
        registry.register(Box::new(command_duration.clone()))?;

        // Events
        let subscriptions_active = Gauge::with_opts(Opts::new(
            "nestdb_subscriptions_active",
            "Number of active event subscriptions",
        ))?;
        registry.register(Box::new(subscriptions_active.clone()))?;

        let events_delivered_total = Counter::with_opts(Opts::new(
            "nestdb_events_delivered_total",
            "Total event notifications queued for subscribers",
        ))?;
        registry.register(Box::new(events_delivered_total.clone()))?;

        let events_dropped_total = Counter::with_opts(Opts::new(
            "nestdb_events_dropped_total",
            "Event notifications dropped on full outbound queues",
        ))?;
        registry.register(Box::new(events_dropped_total.clone()))?;

        // Expiry
        let keys_expired_total = Counter::with_opts(Opts::new(
            "nestdb_keys_expired_total",
            "Total keys removed by the expiry sweeper",
        ))?;
        registry.register(Box::new(keys_expired_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            connections_rejected_total,
            commands_total,
            errors_total,
            command_duration,
            subscriptions_active,
            events_delivered_total,
            events_dropped_total,
            keys_expired_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Binds `addr` and serves metrics until shutdown.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr).await?;
    serve_metrics(listener, metrics, shutdown).await
}

/// Serves `/metrics` and `/health` on an already bound listener.
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let addr = listener.local_addr()?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
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
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => {
            let mut response = Response::new(Full::new(Bytes::from(metrics.encode())));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            response
        }
        "/health" | "/healthz" => Response::new(Full::new(Bytes::from("OK"))),
        _ => {
            let mut response = Response::new(Full::new(Bytes::from("Not Found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.connections_total.inc();
        metrics.connections_active.inc();
        metrics.commands_total.with_label_values(&["get"]).inc();
        metrics.errors_total.with_label_values(&["script"]).inc();
        metrics
            .command_duration
            .with_label_values(&["get"])
            .observe(0.0001);

        let encoded = String::from_utf8(metrics.encode()).unwrap();

        assert!(encoded.contains("nestdb_connections_total"));
        assert!(encoded.contains("nestdb_connections_active"));
        assert!(encoded.contains("nestdb_commands_total"));
        assert!(encoded.contains("nestdb_errors_total"));
        assert!(encoded.contains("nestdb_command_duration_seconds"));
    }

    #[test]
    fn test_gauges_and_counters() {
        let metrics = Metrics::new().unwrap();

        metrics.subscriptions_active.set(3.0);
        metrics.events_delivered_total.inc_by(7.0);
        metrics.keys_expired_total.inc_by(2.0);

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("nestdb_subscriptions_active 3"));
        assert!(encoded.contains("nestdb_events_delivered_total 7"));
        assert!(encoded.contains("nestdb_keys_expired_total 2"));
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.connections_total.inc();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(serve_metrics(listener, metrics, shutdown_rx));

        let body = http_get(addr, "/metrics").await;
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("nestdb_connections_total 1"));

        let health = http_get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with("OK"));

        let missing = http_get(addr, "/nope").await;
        assert!(missing.starts_with("HTTP/1.1 404"));

        shutdown_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
