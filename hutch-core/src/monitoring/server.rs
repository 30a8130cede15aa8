//! Scrape endpoint for the service monitor
//!
//! | Path        | Body                                   |
//! |-------------|----------------------------------------|
//! | `/metrics`  | Prometheus exposition text             |
//! | `/health`   | [`HealthReport`](super::HealthReport) JSON, 503 when unhealthy |
//! | `/`         | plain-text index of the above          |

use super::service::{HealthStatus, ServiceMonitor};
use crate::config::MonitoringConfig;
use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4";

#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    pub listen_addr: SocketAddr,
    /// Scrape path, `/metrics` unless overridden
    pub metrics_path: String,
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            metrics_path: "/metrics".to_string(),
        }
    }
}

impl MetricsServerConfig {
    pub fn from_config(config: &MonitoringConfig) -> Result<Self> {
        let listen_addr = config
            .metrics_addr
            .parse()
            .with_context(|| {
                format!(
                    "monitoring.metrics_addr '{}' is not a socket address",
                    config.metrics_addr
                )
            })?;

        Ok(Self {
            listen_addr,
            ..Self::default()
        })
    }
}

/// Serves the monitor's registry and health report over HTTP/1
pub struct MetricsServer {
    config: MetricsServerConfig,
    monitor: ServiceMonitor,
}

impl MetricsServer {
    pub fn new(config: MetricsServerConfig, monitor: ServiceMonitor) -> Self {
        Self { config, monitor }
    }

    /// Bind the configured address and serve until `cancel` fires
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| {
                format!("cannot bind scrape endpoint on {}", self.config.listen_addr)
            })?;

        self.serve_on(listener, cancel).await
    }

    /// Serve on an already bound listener
    pub async fn serve_on(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let local = listener.local_addr().unwrap_or(self.config.listen_addr);
        info!("Scrape endpoint up at http://{}{}", local, self.config.metrics_path);

        while let Some(accepted) = next_client(&listener, &cancel).await {
            let (stream, peer) = match accepted {
                Ok(client) => client,
                Err(e) => {
                    warn!("Scrape endpoint accept failed: {}", e);
                    continue;
                }
            };

            let monitor = self.monitor.clone();
            let metrics_path = self.config.metrics_path.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let response = route(req.uri().path(), &monitor, &metrics_path);
                    async move { Ok::<_, hyper::Error>(response) }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("Scrape client {} dropped: {}", peer, e);
                }
            });
        }

        info!("Scrape endpoint on {} shut down", local);
        Ok(())
    }
}

/// Next accepted client, or None once `cancel` fires
async fn next_client(
    listener: &TcpListener,
    cancel: &CancellationToken,
) -> Option<std::io::Result<(tokio::net::TcpStream, SocketAddr)>> {
    tokio::select! {
        accepted = listener.accept() => Some(accepted),
        _ = cancel.cancelled() => None,
    }
}

/// Response for a request on `path`
pub fn route(path: &str, monitor: &ServiceMonitor, metrics_path: &str) -> Response<Full<Bytes>> {
    debug!("Scrape request for {}", path);

    match path {
        p if p == metrics_path => scrape(monitor),
        "/health" | "/healthz" => health(monitor),
        "/" => respond(
            StatusCode::OK,
            "text/plain",
            format!(
                "hutch monitor\n\nGET {}  prometheus metrics\nGET /health  session health (json)\n",
                metrics_path
            ),
        ),
        other => {
            warn!("No scrape route for {}", other);
            respond(StatusCode::NOT_FOUND, "text/plain", format!("no route for {}\n", other))
        }
    }
}

fn scrape(monitor: &ServiceMonitor) -> Response<Full<Bytes>> {
    monitor.sync_metrics();
    match encode_metrics(monitor) {
        Ok(text) => respond(StatusCode::OK, PROMETHEUS_TEXT, text),
        Err(e) => {
            error!("Metrics encoding failed: {:#}", e);
            internal_error(e)
        }
    }
}

fn health(monitor: &ServiceMonitor) -> Response<Full<Bytes>> {
    let report = monitor.health();
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    match serde_json::to_string(&report) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => internal_error(e.into()),
    }
}

fn internal_error(err: anyhow::Error) -> Response<Full<Bytes>> {
    respond(
        StatusCode::INTERNAL_SERVER_ERROR,
        "text/plain",
        format!("{:#}\n", err),
    )
}

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn encode_metrics(monitor: &ServiceMonitor) -> Result<String> {
    let families = monitor.metrics_registry().registry().gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&families, &mut buffer)
        .context("prometheus text encoding")?;
    String::from_utf8(buffer).context("prometheus output is not UTF-8")
}
